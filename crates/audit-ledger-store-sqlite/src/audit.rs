use anyhow::{Context, Result};
use audit_ledger_core::{validate_trace, EntityType};
use rusqlite::Connection;
use serde::Serialize;

use crate::collect_rows;
use crate::lifecycle::entity_table;
use crate::trace::{list_traces, TraceFilter};

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct IncompleteTrace {
    pub trace_id: String,
    pub request_id: String,
    pub orchestrator_name: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct TraceVerificationReport {
    pub checked: usize,
    pub complete: usize,
    pub incomplete: Vec<IncompleteTrace>,
}

impl TraceVerificationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// A domain row whose writing request has no COMPLETED ledger record with a
/// successful trace.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct UntracedChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub request_id: String,
    pub orchestrator_name: String,
}

/// Runs completeness validation over every stored trace, optionally for one
/// orchestrator.
///
/// # Errors
/// Returns an error if the traces cannot be read.
pub fn verify_traces(
    conn: &Connection,
    orchestrator_name: Option<&str>,
) -> Result<TraceVerificationReport> {
    let traces = list_traces(
        conn,
        &TraceFilter {
            orchestrator_name: orchestrator_name.map(str::to_string),
            ..TraceFilter::default()
        },
    )?;

    let mut incomplete = Vec::new();
    for trace in &traces {
        if let Err(err) = validate_trace(trace) {
            incomplete.push(IncompleteTrace {
                trace_id: err.trace_id,
                request_id: trace.request_id.clone(),
                orchestrator_name: trace.orchestrator_name.clone(),
                issues: err.issues,
            });
        }
    }

    Ok(TraceVerificationReport {
        checked: traces.len(),
        complete: traces.len() - incomplete.len(),
        incomplete,
    })
}

/// Lists domain rows written outside a completed, successfully traced request.
///
/// # Errors
/// Returns an error if any audit query fails.
pub fn state_changes_without_traces(conn: &Connection) -> Result<Vec<UntracedChange>> {
    let mut out = Vec::new();
    for entity in EntityType::ALL {
        let (table, id_column) = entity_table(entity);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT d.{id_column}, d.request_id, d.orchestrator_name
                 FROM {table} d
                 WHERE NOT EXISTS (
                     SELECT 1 FROM ledger_records l
                     WHERE l.request_id = d.request_id
                       AND l.orchestrator_name = d.orchestrator_name
                       AND l.status = 'COMPLETED'
                 )
                 OR NOT EXISTS (
                     SELECT 1 FROM execution_traces t
                     WHERE t.request_id = d.request_id
                       AND t.orchestrator_name = d.orchestrator_name
                       AND t.result = 'success'
                 )
                 ORDER BY d.{id_column} ASC"
            ))
            .with_context(|| format!("failed to prepare state-change audit for {table}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UntracedChange {
                    entity_type: entity,
                    entity_id: row.get(0)?,
                    request_id: row.get(1)?,
                    orchestrator_name: row.get(2)?,
                })
            })
            .with_context(|| format!("failed to audit state changes in {table}"))?;
        out.extend(collect_rows(rows)?);
    }
    Ok(out)
}
