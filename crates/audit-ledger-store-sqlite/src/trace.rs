use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use audit_ledger_core::{EvidenceBundle, EvidenceItem, ExecutionStep, ExecutionTrace, TraceResult};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

use crate::{collect_rows, conversion_error, json_column, rfc3339, time_column};

const TRACE_COLUMNS: &str = "trace_id, request_id, orchestrator_name, user_id, result, error,
    steps_json, total_steps, input_hash, output_hash,
    started_at, completed_at, duration_ms, created_at";

#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub request_id: Option<String>,
    pub orchestrator_name: Option<String>,
    pub result: Option<TraceResult>,
    pub limit: Option<u32>,
}

/// # Errors
/// Returns an error if the insert fails or the trace cannot be serialized.
pub fn insert_trace(conn: &Connection, trace: &ExecutionTrace) -> Result<()> {
    conn.execute(
        "INSERT INTO execution_traces(
            trace_id, request_id, orchestrator_name, user_id, result, error,
            steps_json, total_steps, input_hash, output_hash,
            started_at, completed_at, duration_ms, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            trace.trace_id.to_string(),
            trace.request_id,
            trace.orchestrator_name,
            trace.user_id,
            trace.result.as_str(),
            trace.error,
            serde_json::to_string(&trace.steps).context("failed to serialize steps")?,
            i64::from(trace.total_steps),
            trace.input_hash,
            trace.output_hash,
            rfc3339(trace.started_at)?,
            rfc3339(trace.completed_at)?,
            i64::try_from(trace.duration_ms)
                .map_err(|_| anyhow!("duration_ms too large for sqlite"))?,
            rfc3339(trace.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert execution trace {}", trace.trace_id))?;
    Ok(())
}

/// # Errors
/// Returns an error if the insert fails or the bundle cannot be serialized.
pub fn insert_evidence(conn: &Connection, bundle: &EvidenceBundle) -> Result<()> {
    conn.execute(
        "INSERT INTO evidence_bundles(bundle_id, trace_id, items_json, metadata_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            bundle.bundle_id.to_string(),
            bundle.trace_id.to_string(),
            serde_json::to_string(&bundle.items).context("failed to serialize evidence items")?,
            serde_json::to_string(&bundle.metadata)
                .context("failed to serialize evidence metadata")?,
            rfc3339(bundle.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert evidence bundle for {}", bundle.trace_id))?;
    Ok(())
}

/// # Errors
/// Returns an error if the query fails or the row is malformed.
pub fn get_trace(conn: &Connection, trace_id: &str) -> Result<Option<ExecutionTrace>> {
    conn.query_row(
        &format!("SELECT {TRACE_COLUMNS} FROM execution_traces WHERE trace_id = ?1"),
        params![trace_id],
        parse_trace_row,
    )
    .optional()
    .with_context(|| format!("failed to load execution trace {trace_id}"))
}

/// Traces matching `filter`, oldest first.
///
/// # Errors
/// Returns an error if the query fails or a row is malformed.
pub fn list_traces(conn: &Connection, filter: &TraceFilter) -> Result<Vec<ExecutionTrace>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TRACE_COLUMNS} FROM execution_traces
             WHERE (?1 IS NULL OR request_id = ?1)
               AND (?2 IS NULL OR orchestrator_name = ?2)
               AND (?3 IS NULL OR result = ?3)
             ORDER BY created_at ASC, trace_id ASC
             LIMIT ?4"
        ))
        .context("failed to prepare trace listing")?;
    let limit = filter.limit.map_or(-1, i64::from);
    let rows = stmt
        .query_map(
            params![
                filter.request_id,
                filter.orchestrator_name,
                filter.result.map(TraceResult::as_str),
                limit,
            ],
            parse_trace_row,
        )
        .context("failed to list execution traces")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails or the row is malformed.
pub fn get_evidence(conn: &Connection, trace_id: &str) -> Result<Option<EvidenceBundle>> {
    conn.query_row(
        "SELECT bundle_id, trace_id, items_json, metadata_json, created_at
         FROM evidence_bundles WHERE trace_id = ?1",
        params![trace_id],
        parse_evidence_row,
    )
    .optional()
    .with_context(|| format!("failed to load evidence bundle for {trace_id}"))
}

fn ulid_column(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_str(raw).map_err(|err| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            format!("invalid ULID {raw}: {err}"),
        )
    })
}

fn parse_trace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionTrace> {
    let trace_id_raw: String = row.get(0)?;
    let result_raw: String = row.get(4)?;
    let steps_raw: String = row.get(6)?;
    let total_steps_i64: i64 = row.get(7)?;
    let started_at_raw: String = row.get(10)?;
    let completed_at_raw: String = row.get(11)?;
    let duration_ms_i64: i64 = row.get(12)?;
    let created_at_raw: String = row.get(13)?;

    let result = TraceResult::parse(&result_raw).ok_or_else(|| {
        conversion_error(
            4,
            rusqlite::types::Type::Text,
            format!("invalid trace result: {result_raw}"),
        )
    })?;
    let steps: Vec<ExecutionStep> = serde_json::from_value(json_column(6, &steps_raw)?)
        .map_err(|err| {
            conversion_error(
                6,
                rusqlite::types::Type::Text,
                format!("invalid steps_json: {err}"),
            )
        })?;
    let total_steps = u32::try_from(total_steps_i64).map_err(|_| {
        conversion_error(
            7,
            rusqlite::types::Type::Integer,
            format!("invalid total_steps: {total_steps_i64}"),
        )
    })?;
    let duration_ms = u64::try_from(duration_ms_i64).map_err(|_| {
        conversion_error(
            12,
            rusqlite::types::Type::Integer,
            format!("invalid duration_ms: {duration_ms_i64}"),
        )
    })?;

    Ok(ExecutionTrace {
        trace_id: ulid_column(0, &trace_id_raw)?,
        request_id: row.get(1)?,
        orchestrator_name: row.get(2)?,
        user_id: row.get(3)?,
        result,
        error: row.get(5)?,
        steps,
        total_steps,
        input_hash: row.get(8)?,
        output_hash: row.get(9)?,
        started_at: time_column(10, &started_at_raw)?,
        completed_at: time_column(11, &completed_at_raw)?,
        duration_ms,
        created_at: time_column(13, &created_at_raw)?,
    })
}

fn parse_evidence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvidenceBundle> {
    let bundle_id_raw: String = row.get(0)?;
    let trace_id_raw: String = row.get(1)?;
    let items_raw: String = row.get(2)?;
    let metadata_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(4)?;

    let items: Vec<EvidenceItem> = serde_json::from_value(json_column(2, &items_raw)?)
        .map_err(|err| {
            conversion_error(
                2,
                rusqlite::types::Type::Text,
                format!("invalid items_json: {err}"),
            )
        })?;

    Ok(EvidenceBundle {
        bundle_id: ulid_column(0, &bundle_id_raw)?,
        trace_id: ulid_column(1, &trace_id_raw)?,
        items,
        metadata: json_column(3, &metadata_raw)?,
        created_at: time_column(4, &created_at_raw)?,
    })
}
