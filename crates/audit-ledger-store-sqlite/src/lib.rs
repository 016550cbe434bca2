#![forbid(unsafe_code)]

pub mod audit;
pub mod ledger;
pub mod lifecycle;
pub mod trace;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use audit_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, EvidenceBundle, ExecutionTrace, LedgerRecord,
    RequestKey, RequestStatus,
};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

pub use audit::{IncompleteTrace, TraceVerificationReport, UntracedChange};
pub use ledger::{Claim, NewClaim};
pub use lifecycle::{
    CommittedRecord, Draft, Milestone, Owner, ProgressEvent, Provenance, RawInput, ReportSnapshot,
    ScoreRecord, SqliteLifecycleReader,
};
pub use trace::TraceFilter;

const LEDGER_SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  user_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('PENDING','PROCESSING','COMPLETED','FAILED')),
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  response_json TEXT,
  error TEXT,
  error_details_json TEXT,
  result_resource_type TEXT,
  result_resource_id TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT,
  expires_at TEXT,
  CHECK (status <> 'COMPLETED' OR response_json IS NOT NULL),
  UNIQUE(request_id, orchestrator_name)
);

CREATE TABLE IF NOT EXISTS execution_traces (
  trace_id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  user_id TEXT,
  result TEXT NOT NULL CHECK (result IN ('success','failed')),
  error TEXT,
  steps_json TEXT NOT NULL,
  total_steps INTEGER NOT NULL,
  input_hash TEXT NOT NULL,
  output_hash TEXT,
  started_at TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  duration_ms INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evidence_bundles (
  bundle_id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL UNIQUE,
  items_json TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES execution_traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger_records(status, created_at);
CREATE INDEX IF NOT EXISTS idx_traces_key ON execution_traces(orchestrator_name, request_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_ledger_completed_no_update
BEFORE UPDATE ON ledger_records
WHEN OLD.status = 'COMPLETED'
BEGIN
  SELECT RAISE(FAIL, 'completed ledger records are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_ledger_delete_failed_only
BEFORE DELETE ON ledger_records
WHEN OLD.status <> 'FAILED'
BEGIN
  SELECT RAISE(FAIL, 'only FAILED ledger records may be deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_execution_traces_no_update
BEFORE UPDATE ON execution_traces
BEGIN
  SELECT RAISE(FAIL, 'execution_traces is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_execution_traces_no_delete
BEFORE DELETE ON execution_traces
BEGIN
  SELECT RAISE(FAIL, 'execution_traces is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_evidence_bundles_no_update
BEFORE UPDATE ON evidence_bundles
BEGIN
  SELECT RAISE(FAIL, 'evidence_bundles is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_evidence_bundles_no_delete
BEFORE DELETE ON evidence_bundles
BEGIN
  SELECT RAISE(FAIL, 'evidence_bundles is append-only');
END;
";

/// Ledger, audit trail and lifecycle domain in one `SQLite` database.
///
/// The engine's atomicity guarantees rely on all of them sharing a
/// connection, so that domain writes and the COMPLETED transition commit in
/// the same transaction.
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    /// Open or create a `SQLite` ledger database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// # Errors
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Applies the schema. Safe to run repeatedly.
    ///
    /// # Errors
    /// Returns an error if any DDL statement fails.
    pub fn migrate(&self) -> Result<()> {
        let fresh = !table_exists(&self.conn, "ledger_records")?;
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply ledger schema")?;
        self.conn
            .execute_batch(lifecycle::LIFECYCLE_SCHEMA)
            .context("failed to apply lifecycle schema")?;

        let now = rfc3339(now_utc())?;
        let recorded = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_SCHEMA_VERSION, now],
            )
            .context("failed to record ledger migration")?;
        debug!(
            version = LEDGER_SCHEMA_VERSION,
            fresh,
            newly_applied = recorded == 1,
            "schema migrated"
        );

        Ok(())
    }

    /// Highest applied schema version, `None` for a database never migrated.
    ///
    /// # Errors
    /// Returns an error if the catalog or the migration table cannot be read.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        if !table_exists(&self.conn, "schema_migrations")? {
            return Ok(None);
        }
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .context("failed to read schema version")
    }

    /// # Errors
    /// Returns an error if the schema version cannot be read.
    pub fn is_migrated(&self) -> Result<bool> {
        Ok(self
            .schema_version()?
            .is_some_and(|version| version >= LEDGER_SCHEMA_VERSION))
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Starts an `IMMEDIATE` transaction so the write lock is taken up front.
    ///
    /// # Errors
    /// Returns an error if the write lock cannot be acquired within the busy
    /// timeout.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")
    }

    /// # Errors
    /// Returns an error if the lookup query fails.
    pub fn lookup(&self, key: &RequestKey) -> Result<Option<LedgerRecord>> {
        ledger::lookup(&self.conn, key)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn list_ledger(&self, status: Option<RequestStatus>) -> Result<Vec<LedgerRecord>> {
        ledger::list(&self.conn, status)
    }

    /// Claims `key` as PROCESSING, or reports the record that already holds it.
    ///
    /// # Errors
    /// Returns an error if the claim transaction fails.
    pub fn claim(&mut self, claim: &NewClaim<'_>) -> Result<Claim> {
        let tx = self.transaction()?;
        let outcome = ledger::claim(&tx, claim)?;
        tx.commit().context("failed to commit claim")?;
        Ok(outcome)
    }

    /// Deletes a FAILED record for the key and claims it afresh, atomically.
    ///
    /// # Errors
    /// Returns an error if the retry transaction fails.
    pub fn retry_after_failure(&mut self, claim: &NewClaim<'_>) -> Result<Claim> {
        let tx = self.transaction()?;
        let outcome = ledger::retry_after_failure(&tx, claim)?;
        tx.commit().context("failed to commit retry claim")?;
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error if the query fails or the stored row is malformed.
    pub fn get_trace(&self, trace_id: &str) -> Result<Option<ExecutionTrace>> {
        trace::get_trace(&self.conn, trace_id)
    }

    /// # Errors
    /// Returns an error if the query fails or a stored row is malformed.
    pub fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<ExecutionTrace>> {
        trace::list_traces(&self.conn, filter)
    }

    /// # Errors
    /// Returns an error if the query fails or the stored row is malformed.
    pub fn get_evidence(&self, trace_id: &str) -> Result<Option<EvidenceBundle>> {
        trace::get_evidence(&self.conn, trace_id)
    }

    /// # Errors
    /// Returns an error if the traces cannot be read.
    pub fn verify_traces(&self, orchestrator_name: Option<&str>) -> Result<TraceVerificationReport> {
        audit::verify_traces(&self.conn, orchestrator_name)
    }

    /// # Errors
    /// Returns an error if the audit query fails.
    pub fn state_changes_without_traces(&self) -> Result<Vec<UntracedChange>> {
        audit::state_changes_without_traces(&self.conn)
    }
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for {table_name}"))?;
    Ok(count > 0)
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

pub(crate) fn conversion_error(
    column: usize,
    sql_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        sql_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn json_column(
    column: usize,
    raw: &str,
) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|err| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            format!("invalid json: {err}"),
        )
    })
}

pub(crate) fn time_column(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(column, rusqlite::types::Type::Text, err.to_string()))
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!("invalid datetime format: {err}"))
}
