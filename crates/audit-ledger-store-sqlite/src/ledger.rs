//! Ledger rows and the claim protocol.
//!
//! Mutual exclusion between concurrent claimers comes solely from
//! `UNIQUE(request_id, orchestrator_name)`: the loser's insert is ignored and
//! it reads back whatever record holds the key. A PENDING row only exists
//! inside the claim transaction.

use anyhow::{anyhow, bail, Context, Result};
use audit_ledger_core::{
    expires_at, now_utc, ErrorDetails, LedgerError, LedgerRecord, RequestKey, RequestStatus,
    ResourceRef,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::{collect_rows, conversion_error, json_column, rfc3339, time_column};

const LEDGER_COLUMNS: &str = "request_id, orchestrator_name, user_id, status,
    payload_json, payload_hash, response_json, error, error_details_json,
    result_resource_type, result_resource_id,
    created_at, started_at, completed_at, expires_at";

/// Everything needed to claim a key.
#[derive(Debug, Clone, Copy)]
pub struct NewClaim<'a> {
    pub key: &'a RequestKey,
    pub payload: &'a Value,
    pub payload_hash: &'a str,
    pub user_id: Option<&'a str>,
    pub ttl_hours: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller now owns the key; the record is PROCESSING.
    Claimed(LedgerRecord),
    /// Another attempt already holds the key.
    Existing(LedgerRecord),
}

/// # Errors
/// Returns an error if the query fails or the row is malformed.
pub fn lookup(conn: &Connection, key: &RequestKey) -> Result<Option<LedgerRecord>> {
    conn.query_row(
        &format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_records
             WHERE request_id = ?1 AND orchestrator_name = ?2"
        ),
        params![key.request_id(), key.orchestrator_name()],
        parse_ledger_row,
    )
    .optional()
    .with_context(|| format!("failed to look up ledger record {key}"))
}

/// # Errors
/// Returns an error if the query fails or a row is malformed.
pub fn list(conn: &Connection, status: Option<RequestStatus>) -> Result<Vec<LedgerRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_records
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, id ASC"
        ))
        .context("failed to prepare ledger listing")?;
    let rows = stmt
        .query_map(params![status.map(RequestStatus::as_str)], parse_ledger_row)
        .context("failed to list ledger records")?;
    collect_rows(rows)
}

/// Inserts PENDING and moves it to PROCESSING. Must run inside a
/// transaction so PENDING is never visible to other connections.
///
/// # Errors
/// Returns an error if any statement fails.
pub fn claim(conn: &Connection, claim: &NewClaim<'_>) -> Result<Claim> {
    let now = now_utc();
    let expires_at = expires_at(now, claim.ttl_hours)?;

    let inserted = conn
        .execute(
            "INSERT INTO ledger_records(
                request_id, orchestrator_name, user_id, status,
                payload_json, payload_hash, created_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(request_id, orchestrator_name) DO NOTHING",
            params![
                claim.key.request_id(),
                claim.key.orchestrator_name(),
                claim.user_id,
                RequestStatus::Pending.as_str(),
                serde_json::to_string(claim.payload).context("failed to serialize payload")?,
                claim.payload_hash,
                rfc3339(now)?,
                rfc3339(expires_at)?,
            ],
        )
        .with_context(|| format!("failed to insert ledger record {}", claim.key))?;

    if inserted == 0 {
        let existing = lookup(conn, claim.key)?
            .ok_or_else(|| anyhow!("ledger record {} conflicted but is missing", claim.key))?;
        debug!(key = %claim.key, status = %existing.status, "claim found existing record");
        return Ok(Claim::Existing(existing));
    }

    RequestStatus::Pending.ensure_transition(RequestStatus::Processing)?;
    let updated = conn
        .execute(
            "UPDATE ledger_records SET status = ?3, started_at = ?4
             WHERE request_id = ?1 AND orchestrator_name = ?2 AND status = 'PENDING'",
            params![
                claim.key.request_id(),
                claim.key.orchestrator_name(),
                RequestStatus::Processing.as_str(),
                rfc3339(now_utc())?,
            ],
        )
        .with_context(|| format!("failed to start processing {}", claim.key))?;
    if updated != 1 {
        bail!("ledger record {} left PENDING during claim", claim.key);
    }

    let record = lookup(conn, claim.key)?
        .ok_or_else(|| anyhow!("ledger record {} missing after claim", claim.key))?;
    debug!(key = %claim.key, "claimed");
    Ok(Claim::Claimed(record))
}

/// Deletes the FAILED record for the key (if still FAILED) and claims afresh.
///
/// # Errors
/// Returns an error if any statement fails.
pub fn retry_after_failure(conn: &Connection, new_claim: &NewClaim<'_>) -> Result<Claim> {
    let deleted = conn
        .execute(
            "DELETE FROM ledger_records
             WHERE request_id = ?1 AND orchestrator_name = ?2 AND status = 'FAILED'",
            params![
                new_claim.key.request_id(),
                new_claim.key.orchestrator_name()
            ],
        )
        .with_context(|| format!("failed to clear failed record {}", new_claim.key))?;
    debug!(key = %new_claim.key, deleted, "retrying after failure");
    claim(conn, new_claim)
}

/// PROCESSING -> COMPLETED with the cached response.
///
/// # Errors
/// Returns an error if the record is not PROCESSING or the update fails.
pub fn complete(
    conn: &Connection,
    key: &RequestKey,
    response: &Value,
    resource: Option<&ResourceRef>,
) -> Result<()> {
    RequestStatus::Processing.ensure_transition(RequestStatus::Completed)?;
    let updated = conn
        .execute(
            "UPDATE ledger_records SET
                status = ?3, response_json = ?4, completed_at = ?5,
                result_resource_type = ?6, result_resource_id = ?7
             WHERE request_id = ?1 AND orchestrator_name = ?2 AND status = 'PROCESSING'",
            params![
                key.request_id(),
                key.orchestrator_name(),
                RequestStatus::Completed.as_str(),
                serde_json::to_string(response).context("failed to serialize response")?,
                rfc3339(now_utc())?,
                resource.map(|r| r.resource_type.as_str()),
                resource.map(|r| r.resource_id.as_str()),
            ],
        )
        .with_context(|| format!("failed to complete ledger record {key}"))?;
    if updated != 1 {
        bail!("ledger record {key} is not PROCESSING; cannot complete");
    }
    Ok(())
}

/// PROCESSING -> FAILED with the error message and its classification.
///
/// # Errors
/// Returns an error if the record is not PROCESSING or the update fails.
pub fn fail(conn: &Connection, key: &RequestKey, details: &ErrorDetails) -> Result<()> {
    RequestStatus::Processing.ensure_transition(RequestStatus::Failed)?;
    let updated = conn
        .execute(
            "UPDATE ledger_records SET
                status = ?3, error = ?4, error_details_json = ?5, completed_at = ?6
             WHERE request_id = ?1 AND orchestrator_name = ?2 AND status = 'PROCESSING'",
            params![
                key.request_id(),
                key.orchestrator_name(),
                RequestStatus::Failed.as_str(),
                details.error_message,
                serde_json::to_string(details).context("failed to serialize error details")?,
                rfc3339(now_utc())?,
            ],
        )
        .with_context(|| format!("failed to mark ledger record {key} failed"))?;
    if updated != 1 {
        bail!("ledger record {key} is not PROCESSING; cannot mark failed");
    }
    Ok(())
}

fn parse_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRecord> {
    let status_raw: String = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    let response_raw: Option<String> = row.get(6)?;
    let error_details_raw: Option<String> = row.get(8)?;
    let resource_type: Option<String> = row.get(9)?;
    let resource_id: Option<String> = row.get(10)?;
    let created_at_raw: String = row.get(11)?;
    let started_at_raw: Option<String> = row.get(12)?;
    let completed_at_raw: Option<String> = row.get(13)?;
    let expires_at_raw: Option<String> = row.get(14)?;

    // Keeps the typed error in the chain so callers can tell a corrupt row
    // from an I/O failure.
    let status = RequestStatus::parse(&status_raw).ok_or_else(|| {
        let request_id: String = row.get(0).unwrap_or_default();
        let orchestrator_name: String = row.get(1).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(LedgerError::UnexpectedStatus {
                key: format!("{orchestrator_name}/{request_id}"),
                status: status_raw.clone(),
            }),
        )
    })?;

    let error_details = error_details_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<ErrorDetails>(raw).map_err(|err| {
                conversion_error(
                    8,
                    rusqlite::types::Type::Text,
                    format!("invalid error_details_json: {err}"),
                )
            })
        })
        .transpose()?;

    let result_resource = match (resource_type, resource_id) {
        (Some(resource_type), Some(resource_id)) => Some(ResourceRef {
            resource_type,
            resource_id,
        }),
        _ => None,
    };

    Ok(LedgerRecord {
        request_id: row.get(0)?,
        orchestrator_name: row.get(1)?,
        user_id: row.get(2)?,
        status,
        payload: json_column(4, &payload_raw)?,
        payload_hash: row.get(5)?,
        response: response_raw
            .as_deref()
            .map(|raw| json_column(6, raw))
            .transpose()?,
        error: row.get(7)?,
        error_details,
        result_resource,
        created_at: time_column(11, &created_at_raw)?,
        started_at: started_at_raw
            .as_deref()
            .map(|raw| time_column(12, raw))
            .transpose()?,
        completed_at: completed_at_raw
            .as_deref()
            .map(|raw| time_column(13, raw))
            .transpose()?,
        expires_at: expires_at_raw
            .as_deref()
            .map(|raw| time_column(14, raw))
            .transpose()?,
    })
}
