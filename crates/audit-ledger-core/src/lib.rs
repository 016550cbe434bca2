//! Pure types and guards for the idempotent, auditable execution engine.
//!
//! Nothing in this crate touches storage. The ledger state machine, the step
//! tracer, the evidence collector and the invariant checker are all
//! deterministic and are driven by `audit-ledger-engine` against a store.

#![forbid(unsafe_code)]

mod access;
mod evidence;
mod invariants;
mod key;
mod ledger;
mod trace;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};

pub use access::{AccessMode, AccessPolicy, EntityType, ReportingAccess, WriteGate};
pub use evidence::{EvidenceBundle, EvidenceCollector, EvidenceInput, EvidenceItem};
pub use invariants::{
    check_committed_has_predecessor, check_reporting_has_committed_predecessor,
    check_reporting_is_read_only, check_scoring_requires_submission,
    check_tracking_target_is_committed, InvariantCheck, InvariantChecker, InvariantError,
    InvariantName, InvariantViolation, LifecycleReader, MilestonePlacement,
    MIN_SCORING_ITEM_COUNT,
};
pub use key::{
    validate_orchestrator_name, validate_request_id, RequestKey, MAX_ORCHESTRATOR_NAME_LEN,
    MAX_REQUEST_ID_LEN,
};
pub use ledger::{
    expires_at, validate_ttl_hours, ErrorDetails, ExistingDisposition, LedgerError, LedgerRecord,
    RequestStatus, ResourceRef, MAX_TTL_HOURS,
};
pub use trace::{
    step_order_issues, validate_trace, ExecutionStep, ExecutionTrace, StepHandle, StepStatus,
    StepTracer, TraceResult, TraceValidationError,
};

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("request_id cannot be empty")]
    EmptyRequestId,
    #[error("request_id too long (max {max} chars, got {len})")]
    RequestIdTooLong { len: usize, max: usize },
    #[error("orchestrator_name cannot be empty")]
    EmptyOrchestratorName,
    #[error("orchestrator_name too long (max {max} chars, got {len})")]
    OrchestratorNameTooLong { len: usize, max: usize },
    #[error("orchestrator_name must contain only alphanumeric characters and underscores, got {name:?}")]
    OrchestratorNameCharset { name: String },
    #[error("ttl_hours too large (max {max}, got {ttl_hours})")]
    TtlOutOfRange { ttl_hours: u32, max: u32 },
    #[error("logged step {action:?} must be finished, not in progress")]
    LoggedStepInProgress { action: String },
    #[error("evidence type cannot be empty")]
    EmptyEvidenceType,
    #[error("evidence confidence MUST be in [0.0, 1.0], got {0}")]
    ConfidenceOutOfRange(f64),
    #[error("invalid RFC3339 timestamp: {0}")]
    Timestamp(String),
    #[error("json serialization failed: {0}")]
    Serialization(String),
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ValidationError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ValidationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ValidationError::Timestamp(err.to_string()))
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`ValidationError::Timestamp`] when parsing fails.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ValidationError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| ValidationError::Timestamp(format!("{value}: {err}")))
}

/// Returns a copy of `value` with every object's keys in sorted order.
///
/// Hashes are computed over this form so that two payloads differing only in
/// key order hash identically.
#[must_use]
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical_json(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the canonical JSON encoding, hex encoded.
///
/// # Errors
/// Returns [`ValidationError::Serialization`] when the value cannot be encoded.
pub fn hash_json(value: &Value) -> Result<String, ValidationError> {
    let bytes = serde_json::to_vec(&canonical_json(value))
        .map_err(|err| ValidationError::Serialization(err.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}
