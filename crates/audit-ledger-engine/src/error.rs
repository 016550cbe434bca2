use audit_ledger_core::{InvariantViolation, LedgerError, RequestKey, ValidationError};
use time::OffsetDateTime;
use ulid::Ulid;

/// How a caller may retry after an [`EngineError`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryGuidance {
    /// The ledger holds a FAILED record; the same request id may be retried.
    SameRequestId,
    /// The key is unusable for now; retry under a new request id.
    NewRequestId,
    /// The ledger is corrupt for this key. Do not retry.
    Never,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("request {orchestrator_name}/{request_id} is already being processed")]
    DuplicateRequest {
        request_id: String,
        orchestrator_name: String,
        started_at: Option<OffsetDateTime>,
    },

    #[error("inconsistent ledger state for {orchestrator_name}/{request_id}: {reason}")]
    InconsistentState {
        request_id: String,
        orchestrator_name: String,
        reason: String,
    },

    #[error("orchestrator {orchestrator_name} failed request {request_id} (trace {trace_id}): {source}")]
    Orchestration {
        request_id: String,
        orchestrator_name: String,
        trace_id: Ulid,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "failed to record failure audit for {orchestrator_name}/{request_id}: {audit_error} (pipeline error: {pipeline_error})"
    )]
    AuditPersistence {
        request_id: String,
        orchestrator_name: String,
        pipeline_error: String,
        audit_error: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn inconsistent(key: &RequestKey, err: &LedgerError) -> Self {
        Self::InconsistentState {
            request_id: key.request_id().to_string(),
            orchestrator_name: key.orchestrator_name().to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn duplicate(key: &RequestKey, started_at: Option<OffsetDateTime>) -> Self {
        Self::DuplicateRequest {
            request_id: key.request_id().to_string(),
            orchestrator_name: key.orchestrator_name().to_string(),
            started_at,
        }
    }

    #[must_use]
    pub fn retry_guidance(&self) -> RetryGuidance {
        match self {
            Self::Orchestration { .. } => RetryGuidance::SameRequestId,
            Self::InconsistentState { .. } => RetryGuidance::Never,
            Self::Validation(_)
            | Self::DuplicateRequest { .. }
            | Self::AuditPersistence { .. }
            | Self::Store(_) => RetryGuidance::NewRequestId,
        }
    }

    /// The error the pipeline raised, for an orchestration failure.
    #[must_use]
    pub fn pipeline_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Orchestration { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The invariant the pipeline violated, for an orchestration failure
    /// caused by one.
    #[must_use]
    pub fn invariant_violation(&self) -> Option<&InvariantViolation> {
        self.pipeline_error().and_then(crate::invariant_violation)
    }

    /// Trace recording the failed attempt, for an orchestration failure.
    #[must_use]
    pub fn trace_id(&self) -> Option<Ulid> {
        match self {
            Self::Orchestration { trace_id, .. } => Some(*trace_id),
            _ => None,
        }
    }
}
