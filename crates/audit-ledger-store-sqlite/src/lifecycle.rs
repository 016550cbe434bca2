//! Lifecycle domain tables: raw input -> baseline -> draft -> committed ->
//! progress, plus scores and reporting snapshots.
//!
//! Every row records the `request_id`/`orchestrator_name` that wrote it, so
//! state changes can be audited against the ledger and trace tables.
//! Committed records, committed milestones and snapshots are immutable.

use anyhow::{anyhow, Context, Result};
use audit_ledger_core::{now_utc, EntityType, LifecycleReader, MilestonePlacement};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{collect_rows, json_column, rfc3339, time_column};

pub(crate) const LIFECYCLE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS owners (
  owner_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_inputs (
  raw_input_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  content_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id)
);

CREATE TABLE IF NOT EXISTS baselines (
  baseline_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  raw_input_id TEXT,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (raw_input_id) REFERENCES raw_inputs(raw_input_id)
);

CREATE TABLE IF NOT EXISTS drafts (
  draft_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  baseline_id TEXT,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (baseline_id) REFERENCES baselines(baseline_id)
);

CREATE TABLE IF NOT EXISTS committed_records (
  committed_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  draft_id TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL,
  committed_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (draft_id) REFERENCES drafts(draft_id)
);

CREATE TABLE IF NOT EXISTS milestones (
  milestone_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  draft_id TEXT NOT NULL,
  committed_id TEXT,
  title TEXT NOT NULL,
  position INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (draft_id) REFERENCES drafts(draft_id),
  FOREIGN KEY (committed_id) REFERENCES committed_records(committed_id)
);

CREATE TABLE IF NOT EXISTS progress_events (
  event_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  milestone_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  notes TEXT,
  occurred_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (milestone_id) REFERENCES milestones(milestone_id)
);

CREATE TABLE IF NOT EXISTS score_records (
  score_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  item_count INTEGER NOT NULL,
  score REAL NOT NULL,
  answers_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id)
);

CREATE TABLE IF NOT EXISTS report_snapshots (
  snapshot_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  committed_id TEXT NOT NULL,
  operation TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  request_id TEXT NOT NULL,
  orchestrator_name TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES owners(owner_id),
  FOREIGN KEY (committed_id) REFERENCES committed_records(committed_id)
);

CREATE INDEX IF NOT EXISTS idx_milestones_draft ON milestones(draft_id, position);
CREATE INDEX IF NOT EXISTS idx_milestones_committed ON milestones(committed_id, position);
CREATE INDEX IF NOT EXISTS idx_committed_owner ON committed_records(owner_id, committed_at);
CREATE INDEX IF NOT EXISTS idx_progress_owner ON progress_events(owner_id, occurred_at);

CREATE TRIGGER IF NOT EXISTS trg_committed_records_no_update
BEFORE UPDATE ON committed_records
BEGIN
  SELECT RAISE(FAIL, 'committed_records is immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_committed_records_no_delete
BEFORE DELETE ON committed_records
BEGIN
  SELECT RAISE(FAIL, 'committed_records is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_committed_milestones_no_update
BEFORE UPDATE ON milestones
WHEN OLD.committed_id IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'committed milestones are immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_committed_milestones_no_delete
BEFORE DELETE ON milestones
WHEN OLD.committed_id IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'committed milestones are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_report_snapshots_no_update
BEFORE UPDATE ON report_snapshots
BEGIN
  SELECT RAISE(FAIL, 'report_snapshots is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_report_snapshots_no_delete
BEFORE DELETE ON report_snapshots
BEGIN
  SELECT RAISE(FAIL, 'report_snapshots is append-only');
END;
";

/// Table and primary-key column backing each entity type.
#[must_use]
pub fn entity_table(entity: EntityType) -> (&'static str, &'static str) {
    match entity {
        EntityType::Owner => ("owners", "owner_id"),
        EntityType::RawInput => ("raw_inputs", "raw_input_id"),
        EntityType::Baseline => ("baselines", "baseline_id"),
        EntityType::Draft => ("drafts", "draft_id"),
        EntityType::Committed => ("committed_records", "committed_id"),
        EntityType::Milestone => ("milestones", "milestone_id"),
        EntityType::ProgressEvent => ("progress_events", "event_id"),
        EntityType::Score => ("score_records", "score_id"),
        EntityType::Snapshot => ("report_snapshots", "snapshot_id"),
    }
}

/// Which request wrote a row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Provenance<'a> {
    pub request_id: &'a str,
    pub orchestrator_name: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Owner {
    pub owner_id: String,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawInput {
    pub raw_input_id: String,
    pub owner_id: String,
    pub content: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Draft {
    pub draft_id: String,
    pub owner_id: String,
    pub baseline_id: Option<String>,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub milestone_id: String,
    pub owner_id: String,
    pub draft_id: String,
    pub committed_id: Option<String>,
    pub title: String,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommittedRecord {
    pub committed_id: String,
    pub owner_id: String,
    pub draft_id: String,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub event_id: String,
    pub owner_id: String,
    pub milestone_id: String,
    pub event_type: String,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    pub score_id: String,
    pub owner_id: String,
    pub item_count: u32,
    pub score: f64,
    pub answers: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSnapshot {
    pub snapshot_id: String,
    pub owner_id: String,
    pub committed_id: String,
    pub operation: String,
    pub snapshot: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

fn new_id() -> String {
    Ulid::new().to_string()
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_owner(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    display_name: &str,
) -> Result<Owner> {
    let created_at = now_utc();
    conn.execute(
        "INSERT INTO owners(owner_id, display_name, created_at, request_id, orchestrator_name)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            owner_id,
            display_name,
            rfc3339(created_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .with_context(|| format!("failed to insert owner {owner_id}"))?;
    Ok(Owner {
        owner_id: owner_id.to_string(),
        display_name: display_name.to_string(),
        created_at,
    })
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_raw_input(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    content: &Value,
) -> Result<RawInput> {
    let raw_input_id = new_id();
    let created_at = now_utc();
    conn.execute(
        "INSERT INTO raw_inputs(
            raw_input_id, owner_id, content_json, created_at, request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            raw_input_id,
            owner_id,
            serde_json::to_string(content).context("failed to serialize raw input")?,
            rfc3339(created_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .context("failed to insert raw input")?;
    Ok(RawInput {
        raw_input_id,
        owner_id: owner_id.to_string(),
        content: content.clone(),
        created_at,
    })
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_baseline(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    raw_input_id: Option<&str>,
    title: &str,
) -> Result<String> {
    let baseline_id = new_id();
    conn.execute(
        "INSERT INTO baselines(
            baseline_id, owner_id, raw_input_id, title, created_at, request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            baseline_id,
            owner_id,
            raw_input_id,
            title,
            rfc3339(now_utc())?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .context("failed to insert baseline")?;
    Ok(baseline_id)
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_draft(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    baseline_id: Option<&str>,
    title: &str,
) -> Result<Draft> {
    let draft_id = new_id();
    let created_at = now_utc();
    conn.execute(
        "INSERT INTO drafts(
            draft_id, owner_id, baseline_id, title, created_at, request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            draft_id,
            owner_id,
            baseline_id,
            title,
            rfc3339(created_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .context("failed to insert draft")?;
    Ok(Draft {
        draft_id,
        owner_id: owner_id.to_string(),
        baseline_id: baseline_id.map(str::to_string),
        title: title.to_string(),
        created_at,
    })
}

/// Appends a milestone to a draft, after its existing milestones.
///
/// # Errors
/// Returns an error if the draft does not exist or the insert fails.
pub fn insert_draft_milestone(
    conn: &Connection,
    provenance: Provenance<'_>,
    draft_id: &str,
    title: &str,
) -> Result<Milestone> {
    let draft = get_draft(conn, draft_id)?.ok_or_else(|| anyhow!("draft {draft_id} not found"))?;
    let position = u32::try_from(milestones_for_draft(conn, draft_id)?.len())
        .map_err(|_| anyhow!("too many milestones in draft {draft_id}"))?;
    let milestone = Milestone {
        milestone_id: new_id(),
        owner_id: draft.owner_id,
        draft_id: draft_id.to_string(),
        committed_id: None,
        title: title.to_string(),
        position,
    };
    insert_milestone_row(conn, provenance, &milestone)?;
    Ok(milestone)
}

fn insert_milestone_row(
    conn: &Connection,
    provenance: Provenance<'_>,
    milestone: &Milestone,
) -> Result<()> {
    conn.execute(
        "INSERT INTO milestones(
            milestone_id, owner_id, draft_id, committed_id, title, position,
            created_at, request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            milestone.milestone_id,
            milestone.owner_id,
            milestone.draft_id,
            milestone.committed_id,
            milestone.title,
            i64::from(milestone.position),
            rfc3339(now_utc())?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .with_context(|| format!("failed to insert milestone {}", milestone.milestone_id))?;
    Ok(())
}

/// Freezes a draft into a committed record, copying its milestones.
///
/// Callers check `committed_has_predecessor` first; the `UNIQUE(draft_id)`
/// constraint backs it up.
///
/// # Errors
/// Returns an error if the draft is missing or any insert fails.
pub fn insert_committed(
    conn: &Connection,
    provenance: Provenance<'_>,
    draft_id: &str,
    title: Option<&str>,
) -> Result<CommittedRecord> {
    let draft = get_draft(conn, draft_id)?.ok_or_else(|| anyhow!("draft {draft_id} not found"))?;
    let committed_id = new_id();
    let committed_at = now_utc();
    let title = title.unwrap_or(&draft.title).to_string();

    conn.execute(
        "INSERT INTO committed_records(
            committed_id, owner_id, draft_id, title, committed_at, request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            committed_id,
            draft.owner_id,
            draft_id,
            title,
            rfc3339(committed_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .with_context(|| format!("failed to commit draft {draft_id}"))?;

    let mut milestones = Vec::new();
    for source in milestones_for_draft(conn, draft_id)? {
        let copy = Milestone {
            milestone_id: new_id(),
            committed_id: Some(committed_id.clone()),
            ..source
        };
        insert_milestone_row(conn, provenance, &copy)?;
        milestones.push(copy);
    }

    Ok(CommittedRecord {
        committed_id,
        owner_id: draft.owner_id,
        draft_id: draft_id.to_string(),
        title,
        committed_at,
        milestones,
    })
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_progress_event(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    milestone_id: &str,
    event_type: &str,
    notes: Option<&str>,
) -> Result<ProgressEvent> {
    let event = ProgressEvent {
        event_id: new_id(),
        owner_id: owner_id.to_string(),
        milestone_id: milestone_id.to_string(),
        event_type: event_type.to_string(),
        notes: notes.map(str::to_string),
        occurred_at: now_utc(),
    };
    conn.execute(
        "INSERT INTO progress_events(
            event_id, owner_id, milestone_id, event_type, notes, occurred_at,
            request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id,
            event.owner_id,
            event.milestone_id,
            event.event_type,
            event.notes,
            rfc3339(event.occurred_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .with_context(|| format!("failed to record progress on {milestone_id}"))?;
    Ok(event)
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_score(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    answers: &Value,
    item_count: u32,
    score: f64,
) -> Result<ScoreRecord> {
    let record = ScoreRecord {
        score_id: new_id(),
        owner_id: owner_id.to_string(),
        item_count,
        score,
        answers: answers.clone(),
        created_at: now_utc(),
    };
    conn.execute(
        "INSERT INTO score_records(
            score_id, owner_id, item_count, score, answers_json, created_at,
            request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.score_id,
            record.owner_id,
            i64::from(record.item_count),
            record.score,
            serde_json::to_string(answers).context("failed to serialize answers")?,
            rfc3339(record.created_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .context("failed to insert score")?;
    Ok(record)
}

/// # Errors
/// Returns an error if the insert fails.
pub fn insert_snapshot(
    conn: &Connection,
    provenance: Provenance<'_>,
    owner_id: &str,
    committed_id: &str,
    operation: &str,
    snapshot: &Value,
) -> Result<ReportSnapshot> {
    let record = ReportSnapshot {
        snapshot_id: new_id(),
        owner_id: owner_id.to_string(),
        committed_id: committed_id.to_string(),
        operation: operation.to_string(),
        snapshot: snapshot.clone(),
        created_at: now_utc(),
    };
    conn.execute(
        "INSERT INTO report_snapshots(
            snapshot_id, owner_id, committed_id, operation, snapshot_json, created_at,
            request_id, orchestrator_name
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.snapshot_id,
            record.owner_id,
            record.committed_id,
            record.operation,
            serde_json::to_string(snapshot).context("failed to serialize snapshot")?,
            rfc3339(record.created_at)?,
            provenance.request_id,
            provenance.orchestrator_name,
        ],
    )
    .context("failed to insert report snapshot")?;
    Ok(record)
}

/// # Errors
/// Returns an error if the query fails.
pub fn get_owner(conn: &Connection, owner_id: &str) -> Result<Option<Owner>> {
    conn.query_row(
        "SELECT owner_id, display_name, created_at FROM owners WHERE owner_id = ?1",
        params![owner_id],
        |row| {
            let created_at_raw: String = row.get(2)?;
            Ok(Owner {
                owner_id: row.get(0)?,
                display_name: row.get(1)?,
                created_at: time_column(2, &created_at_raw)?,
            })
        },
    )
    .optional()
    .with_context(|| format!("failed to load owner {owner_id}"))
}

/// # Errors
/// Returns an error if the query fails.
pub fn raw_inputs_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<RawInput>> {
    let mut stmt = conn
        .prepare(
            "SELECT raw_input_id, owner_id, content_json, created_at
             FROM raw_inputs WHERE owner_id = ?1
             ORDER BY created_at ASC, raw_input_id ASC",
        )
        .context("failed to prepare raw input query")?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            let content_raw: String = row.get(2)?;
            let created_at_raw: String = row.get(3)?;
            Ok(RawInput {
                raw_input_id: row.get(0)?,
                owner_id: row.get(1)?,
                content: json_column(2, &content_raw)?,
                created_at: time_column(3, &created_at_raw)?,
            })
        })
        .context("failed to list raw inputs")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails.
pub fn get_draft(conn: &Connection, draft_id: &str) -> Result<Option<Draft>> {
    conn.query_row(
        "SELECT draft_id, owner_id, baseline_id, title, created_at FROM drafts WHERE draft_id = ?1",
        params![draft_id],
        |row| {
            let created_at_raw: String = row.get(4)?;
            Ok(Draft {
                draft_id: row.get(0)?,
                owner_id: row.get(1)?,
                baseline_id: row.get(2)?,
                title: row.get(3)?,
                created_at: time_column(4, &created_at_raw)?,
            })
        },
    )
    .optional()
    .with_context(|| format!("failed to load draft {draft_id}"))
}

/// # Errors
/// Returns an error if the query fails.
pub fn get_committed(conn: &Connection, committed_id: &str) -> Result<Option<CommittedRecord>> {
    let header = conn
        .query_row(
            "SELECT committed_id, owner_id, draft_id, title, committed_at
             FROM committed_records WHERE committed_id = ?1",
            params![committed_id],
            |row| {
                let committed_at_raw: String = row.get(4)?;
                Ok(CommittedRecord {
                    committed_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    draft_id: row.get(2)?,
                    title: row.get(3)?,
                    committed_at: time_column(4, &committed_at_raw)?,
                    milestones: Vec::new(),
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load committed record {committed_id}"))?;

    match header {
        Some(mut record) => {
            record.milestones = milestones_for_committed(conn, committed_id)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn parse_milestone_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Milestone> {
    let position_i64: i64 = row.get(5)?;
    Ok(Milestone {
        milestone_id: row.get(0)?,
        owner_id: row.get(1)?,
        draft_id: row.get(2)?,
        committed_id: row.get(3)?,
        title: row.get(4)?,
        position: u32::try_from(position_i64).map_err(|_| {
            crate::conversion_error(
                5,
                rusqlite::types::Type::Integer,
                format!("invalid milestone position: {position_i64}"),
            )
        })?,
    })
}

/// Milestones still attached to the draft itself (not committed copies).
///
/// # Errors
/// Returns an error if the query fails.
pub fn milestones_for_draft(conn: &Connection, draft_id: &str) -> Result<Vec<Milestone>> {
    let mut stmt = conn
        .prepare(
            "SELECT milestone_id, owner_id, draft_id, committed_id, title, position
             FROM milestones WHERE draft_id = ?1 AND committed_id IS NULL
             ORDER BY position ASC",
        )
        .context("failed to prepare draft milestone query")?;
    let rows = stmt
        .query_map(params![draft_id], parse_milestone_row)
        .context("failed to list draft milestones")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails.
pub fn milestones_for_committed(conn: &Connection, committed_id: &str) -> Result<Vec<Milestone>> {
    let mut stmt = conn
        .prepare(
            "SELECT milestone_id, owner_id, draft_id, committed_id, title, position
             FROM milestones WHERE committed_id = ?1
             ORDER BY position ASC",
        )
        .context("failed to prepare committed milestone query")?;
    let rows = stmt
        .query_map(params![committed_id], parse_milestone_row)
        .context("failed to list committed milestones")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails.
pub fn progress_events_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<ProgressEvent>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_id, owner_id, milestone_id, event_type, notes, occurred_at
             FROM progress_events WHERE owner_id = ?1
             ORDER BY occurred_at ASC, event_id ASC",
        )
        .context("failed to prepare progress query")?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            let occurred_at_raw: String = row.get(5)?;
            Ok(ProgressEvent {
                event_id: row.get(0)?,
                owner_id: row.get(1)?,
                milestone_id: row.get(2)?,
                event_type: row.get(3)?,
                notes: row.get(4)?,
                occurred_at: time_column(5, &occurred_at_raw)?,
            })
        })
        .context("failed to list progress events")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails.
pub fn scores_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<ScoreRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT score_id, owner_id, item_count, score, answers_json, created_at
             FROM score_records WHERE owner_id = ?1
             ORDER BY created_at ASC, score_id ASC",
        )
        .context("failed to prepare score query")?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            let item_count_i64: i64 = row.get(2)?;
            let answers_raw: String = row.get(4)?;
            let created_at_raw: String = row.get(5)?;
            Ok(ScoreRecord {
                score_id: row.get(0)?,
                owner_id: row.get(1)?,
                item_count: u32::try_from(item_count_i64).map_err(|_| {
                    crate::conversion_error(
                        2,
                        rusqlite::types::Type::Integer,
                        format!("invalid item_count: {item_count_i64}"),
                    )
                })?,
                score: row.get(3)?,
                answers: json_column(4, &answers_raw)?,
                created_at: time_column(5, &created_at_raw)?,
            })
        })
        .context("failed to list scores")?;
    collect_rows(rows)
}

/// # Errors
/// Returns an error if the query fails.
pub fn snapshots_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<ReportSnapshot>> {
    let mut stmt = conn
        .prepare(
            "SELECT snapshot_id, owner_id, committed_id, operation, snapshot_json, created_at
             FROM report_snapshots WHERE owner_id = ?1
             ORDER BY created_at ASC, snapshot_id ASC",
        )
        .context("failed to prepare snapshot query")?;
    let rows = stmt
        .query_map(params![owner_id], |row| {
            let snapshot_raw: String = row.get(4)?;
            let created_at_raw: String = row.get(5)?;
            Ok(ReportSnapshot {
                snapshot_id: row.get(0)?,
                owner_id: row.get(1)?,
                committed_id: row.get(2)?,
                operation: row.get(3)?,
                snapshot: json_column(4, &snapshot_raw)?,
                created_at: time_column(5, &created_at_raw)?,
            })
        })
        .context("failed to list snapshots")?;
    collect_rows(rows)
}

/// Row count of the table backing `entity`.
///
/// # Errors
/// Returns an error if the query fails.
pub fn count_rows(conn: &Connection, entity: EntityType) -> Result<u64> {
    let (table, _) = entity_table(entity);
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("failed to count {table}"))?;
    u64::try_from(count).map_err(|_| anyhow!("negative row count for {table}"))
}

/// [`LifecycleReader`] over a connection or an open transaction.
pub struct SqliteLifecycleReader<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteLifecycleReader<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl LifecycleReader for SqliteLifecycleReader<'_> {
    fn draft_owner(&self, draft_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT owner_id FROM drafts WHERE draft_id = ?1",
                params![draft_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read draft owner")
    }

    fn committed_for_draft(&self, draft_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT committed_id FROM committed_records WHERE draft_id = ?1",
                params![draft_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read committed record for draft")
    }

    fn committed_owner(&self, committed_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT owner_id FROM committed_records WHERE committed_id = ?1",
                params![committed_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read committed record owner")
    }

    fn latest_committed_for_owner(&self, owner_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT committed_id FROM committed_records WHERE owner_id = ?1
                 ORDER BY committed_at DESC, committed_id DESC LIMIT 1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read latest committed record")
    }

    fn milestone_placement(&self, milestone_id: &str) -> Result<Option<MilestonePlacement>> {
        self.conn
            .query_row(
                "SELECT milestone_id, draft_id, committed_id FROM milestones WHERE milestone_id = ?1",
                params![milestone_id],
                |row| {
                    Ok(MilestonePlacement {
                        milestone_id: row.get(0)?,
                        draft_id: row.get(1)?,
                        committed_id: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to read milestone placement")
    }
}
