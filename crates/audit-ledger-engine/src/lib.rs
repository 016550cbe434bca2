#![forbid(unsafe_code)]

//! Idempotent, audited execution of pipelines.
//!
//! [`ExecutionEngine::execute`] runs a fixed protocol per call: validate the
//! key, consult the ledger, claim, run the pipeline inside one transaction,
//! then either commit the domain writes together with the trace and the
//! COMPLETED ledger row, or roll them back and commit a failed trace and the
//! FAILED ledger row in a separate transaction.

mod context;
mod error;
mod session;

use anyhow::Context as _;
use audit_ledger_core::{
    hash_json, now_utc, validate_trace, validate_ttl_hours, AccessPolicy, ErrorDetails, EvidenceBundle, ExecutionStep, ExecutionTrace,
    ExistingDisposition, InvariantError, InvariantViolation, LedgerError, LedgerRecord, RequestKey,
    TraceResult, ValidationError,
};
use audit_ledger_store_sqlite::ledger;
use audit_ledger_store_sqlite::trace::{insert_evidence, insert_trace};
use audit_ledger_store_sqlite::{Claim, NewClaim, SqliteLedgerStore};
use rusqlite::Transaction;
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use ulid::Ulid;

use context::AttemptRecord;

pub use context::ExecutionContext;
pub use error::{EngineError, RetryGuidance};
pub use session::DomainSession;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_ttl_hours: u32,
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 24,
            engine_version: "audit-ledger.v1".to_string(),
        }
    }
}

/// One call to [`ExecutionEngine::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub request_id: String,
    pub orchestrator_name: String,
    pub payload: Value,
    pub user_id: Option<String>,
    pub ttl_hours: Option<u32>,
}

impl ExecuteRequest {
    pub fn new(
        request_id: impl Into<String>,
        orchestrator_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            orchestrator_name: orchestrator_name.into(),
            payload,
            user_id: None,
            ttl_hours: None,
        }
    }

    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn ttl_hours(mut self, ttl_hours: u32) -> Self {
        self.ttl_hours = Some(ttl_hours);
        self
    }
}

/// Business logic wrapped by the engine.
///
/// A pipeline reports failure by returning `Err`; the engine never inspects
/// the returned value for error markers.
pub trait Pipeline {
    /// # Errors
    /// Any error fails the attempt and rolls back its domain writes.
    fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<Value>;

    /// Capability handed to the attempt's [`DomainSession`].
    fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::unrestricted()
    }
}

/// A [`Pipeline`] built from a closure.
pub struct FnPipeline<F> {
    run: F,
    policy: AccessPolicy,
}

/// Wraps a closure as an unrestricted [`Pipeline`].
pub fn pipeline_fn<F>(run: F) -> FnPipeline<F>
where
    F: Fn(&mut ExecutionContext<'_>) -> anyhow::Result<Value>,
{
    FnPipeline {
        run,
        policy: AccessPolicy::unrestricted(),
    }
}

impl<F> FnPipeline<F> {
    #[must_use]
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<F> Pipeline for FnPipeline<F>
where
    F: Fn(&mut ExecutionContext<'_>) -> anyhow::Result<Value>,
{
    fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<Value> {
        (self.run)(ctx)
    }

    fn access_policy(&self) -> AccessPolicy {
        self.policy.clone()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSource {
    /// The pipeline ran in this call.
    Executed,
    /// The response came from a COMPLETED ledger record.
    Cached { payload_matches: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub response: Value,
    pub source: ResponseSource,
    /// Trace written by this call; `None` for cache hits.
    pub trace_id: Option<Ulid>,
}

struct Attempt<'r> {
    key: RequestKey,
    request: &'r ExecuteRequest,
    payload_hash: String,
    started_at: OffsetDateTime,
}

pub struct ExecutionEngine {
    store: SqliteLedgerStore,
    config: EngineConfig,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(store: SqliteLedgerStore) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(store: SqliteLedgerStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &SqliteLedgerStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> SqliteLedgerStore {
        self.store
    }

    /// Runs `pipeline` at most once per request key and returns its response.
    ///
    /// # Errors
    /// See [`ExecutionEngine::execute_with_outcome`].
    pub fn execute(
        &mut self,
        request: &ExecuteRequest,
        pipeline: &dyn Pipeline,
    ) -> Result<Value, EngineError> {
        self.execute_with_outcome(request, pipeline)
            .map(|outcome| outcome.response)
    }

    /// Runs `pipeline` at most once per request key, reporting whether the
    /// response was computed now or served from the ledger.
    ///
    /// # Errors
    /// - [`EngineError::Validation`] for a malformed key; nothing is written.
    /// - [`EngineError::DuplicateRequest`] while another attempt holds the key.
    /// - [`EngineError::InconsistentState`] for a corrupt ledger record.
    /// - [`EngineError::Orchestration`] when the pipeline fails; its failed
    ///   trace and the FAILED ledger record are committed first.
    /// - [`EngineError::AuditPersistence`] when that failure audit cannot be
    ///   committed.
    /// - [`EngineError::Store`] for storage failures outside the pipeline.
    pub fn execute_with_outcome(
        &mut self,
        request: &ExecuteRequest,
        pipeline: &dyn Pipeline,
    ) -> Result<ExecutionOutcome, EngineError> {
        let key = RequestKey::new(&request.request_id, &request.orchestrator_name)?;
        let payload_hash = hash_json(&request.payload)?;
        let ttl_hours = request.ttl_hours.unwrap_or(self.config.default_ttl_hours);
        validate_ttl_hours(ttl_hours)?;

        let claim = NewClaim {
            key: &key,
            payload: &request.payload,
            payload_hash: &payload_hash,
            user_id: request.user_id.as_deref(),
            ttl_hours,
        };

        let existing = self
            .store
            .lookup(&key)
            .map_err(|err| store_error(&key, err))?;
        let claimed = match existing {
            None => self.store.claim(&claim),
            Some(existing) => match Self::resolve_existing(&key, &existing, &payload_hash)? {
                Resolution::Cached(outcome) => return Ok(outcome),
                Resolution::Retry => self.store.retry_after_failure(&claim),
            },
        }
        .map_err(|err| store_error(&key, err))?;
        match claimed {
            Claim::Claimed(_) => {}
            Claim::Existing(existing) => {
                match Self::resolve_existing(&key, &existing, &payload_hash)? {
                    Resolution::Cached(outcome) => return Ok(outcome),
                    // Another caller failed and released the key between our
                    // lookup and claim; it is still contended.
                    Resolution::Retry => {
                        return Err(EngineError::duplicate(&key, existing.started_at))
                    }
                }
            }
        }
        info!(key = %key, "claimed request");

        let attempt = Attempt {
            key,
            request,
            payload_hash,
            started_at: now_utc(),
        };
        self.run_attempt(&attempt, pipeline)
    }

    fn resolve_existing(
        key: &RequestKey,
        existing: &LedgerRecord,
        payload_hash: &str,
    ) -> Result<Resolution, EngineError> {
        let disposition = existing
            .disposition()
            .map_err(|err| EngineError::inconsistent(key, &err))?;
        match disposition {
            ExistingDisposition::ReturnCached(response) => {
                let payload_matches = existing.payload_hash == payload_hash;
                if payload_matches {
                    info!(key = %key, "returning cached response");
                } else {
                    warn!(
                        key = %key,
                        stored_hash = %existing.payload_hash,
                        request_hash = %payload_hash,
                        "payload differs from the completed request; returning cached response"
                    );
                }
                Ok(Resolution::Cached(ExecutionOutcome {
                    response,
                    source: ResponseSource::Cached { payload_matches },
                    trace_id: None,
                }))
            }
            ExistingDisposition::InFlight => {
                warn!(key = %key, "duplicate request while processing");
                Err(EngineError::duplicate(key, existing.started_at))
            }
            ExistingDisposition::RetryAfterFailure => {
                info!(key = %key, "retrying failed request");
                Ok(Resolution::Retry)
            }
        }
    }

    fn run_attempt(
        &mut self,
        attempt: &Attempt<'_>,
        pipeline: &dyn Pipeline,
    ) -> Result<ExecutionOutcome, EngineError> {
        let request = attempt.request;
        let tx = 'tx: {
            let err = match self.store.transaction() {
                Ok(tx) => break 'tx tx,
                Err(err) => err,
            };
            // The claim is already committed; release it through the failure
            // path so the key does not stay PROCESSING.
            return Err(self.record_failure(attempt, AttemptRecord::default(), err));
        };
        let mut ctx = ExecutionContext::new(
            &tx,
            &attempt.key,
            &request.payload,
            request.user_id.as_deref(),
            pipeline.access_policy(),
        );

        match pipeline.run(&mut ctx) {
            Ok(response) => {
                let record = ctx.finish(None);
                let trace_id = Ulid::new();
                if let Err(err) =
                    commit_success(tx, &self.config, attempt, trace_id, &record, &response)
                {
                    // The attempt transaction rolled back; the key is released
                    // through the failure path like any pipeline error.
                    return Err(self.record_failure(attempt, record, err));
                }
                info!(key = %attempt.key, trace_id = %trace_id, "completed request");
                Ok(ExecutionOutcome {
                    response,
                    source: ResponseSource::Executed,
                    trace_id: Some(trace_id),
                })
            }
            Err(err) => {
                let record = ctx.finish(Some(&err.to_string()));
                drop(tx);
                Err(self.record_failure(attempt, record, err))
            }
        }
    }

    /// Commits the failed trace and the FAILED ledger row after the attempt
    /// transaction has been rolled back.
    fn record_failure(
        &mut self,
        attempt: &Attempt<'_>,
        record: AttemptRecord,
        err: anyhow::Error,
    ) -> EngineError {
        let message = err.to_string();
        let trace_id = Ulid::new();
        let step_count = record.steps.len();
        let trace = build_trace(
            attempt,
            trace_id,
            TraceResult::Failed,
            Some(message.clone()),
            record.steps,
            None,
        );
        let metadata = evidence_metadata(&self.config, record.evidence.len());
        let bundle = record.evidence.into_bundle(trace_id, metadata);
        let details = ErrorDetails {
            error_type: error_type(&err),
            error_message: message.clone(),
        };

        match commit_failure(&mut self.store, &attempt.key, &trace, bundle.as_ref(), &details) {
            Ok(()) => {
                error!(
                    key = %attempt.key,
                    trace_id = %trace_id,
                    steps = step_count,
                    error = %message,
                    "request failed"
                );
                EngineError::Orchestration {
                    request_id: attempt.key.request_id().to_string(),
                    orchestrator_name: attempt.key.orchestrator_name().to_string(),
                    trace_id,
                    source: err,
                }
            }
            Err(audit_err) => {
                let audit_error = format!("{audit_err:#}");
                error!(
                    key = %attempt.key,
                    error = %message,
                    audit_error = %audit_error,
                    "failed to record failure audit"
                );
                EngineError::AuditPersistence {
                    request_id: attempt.key.request_id().to_string(),
                    orchestrator_name: attempt.key.orchestrator_name().to_string(),
                    pipeline_error: message,
                    audit_error,
                }
            }
        }
    }
}

fn commit_success(
    tx: Transaction<'_>,
    config: &EngineConfig,
    attempt: &Attempt<'_>,
    trace_id: Ulid,
    record: &AttemptRecord,
    response: &Value,
) -> anyhow::Result<()> {
    let output_hash = hash_json(response)?;
    let trace = build_trace(
        attempt,
        trace_id,
        TraceResult::Success,
        None,
        record.steps.clone(),
        Some(output_hash),
    );
    validate_trace(&trace)?;
    insert_trace(&tx, &trace)?;
    let metadata = evidence_metadata(config, record.evidence.len());
    if let Some(bundle) = record.evidence.clone().into_bundle(trace_id, metadata) {
        insert_evidence(&tx, &bundle)?;
    }
    ledger::complete(
        &tx,
        &attempt.key,
        response,
        record.result_resource.as_ref(),
    )?;
    tx.commit().context("failed to commit completed attempt")
}

fn commit_failure(
    store: &mut SqliteLedgerStore,
    key: &RequestKey,
    trace: &ExecutionTrace,
    bundle: Option<&EvidenceBundle>,
    details: &ErrorDetails,
) -> anyhow::Result<()> {
    let tx = store.transaction()?;
    insert_trace(&tx, trace)?;
    if let Some(bundle) = bundle {
        insert_evidence(&tx, bundle)?;
    }
    ledger::fail(&tx, key, details)?;
    tx.commit().context("failed to commit failure audit")
}

fn build_trace(
    attempt: &Attempt<'_>,
    trace_id: Ulid,
    result: TraceResult,
    error: Option<String>,
    steps: Vec<ExecutionStep>,
    output_hash: Option<String>,
) -> ExecutionTrace {
    let completed_at = now_utc();
    let duration_ms =
        u64::try_from((completed_at - attempt.started_at).whole_milliseconds()).unwrap_or(0);
    ExecutionTrace {
        trace_id,
        request_id: attempt.key.request_id().to_string(),
        orchestrator_name: attempt.key.orchestrator_name().to_string(),
        user_id: attempt.request.user_id.clone(),
        result,
        error,
        total_steps: u32::try_from(steps.len()).unwrap_or(u32::MAX),
        steps,
        input_hash: attempt.payload_hash.clone(),
        output_hash,
        started_at: attempt.started_at,
        completed_at,
        duration_ms,
        created_at: completed_at,
    }
}

fn evidence_metadata(config: &EngineConfig, total_items: usize) -> Value {
    json!({
        "total_items": total_items,
        "engine_version": config.engine_version,
    })
}

enum Resolution {
    Cached(ExecutionOutcome),
    Retry,
}

/// Ledger lookups and claims that trip over a corrupt row are inconsistent
/// state, not infrastructure failures.
fn store_error(key: &RequestKey, err: anyhow::Error) -> EngineError {
    let corrupt = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<LedgerError>())
        .cloned();
    match corrupt {
        Some(ledger_err) => EngineError::inconsistent(key, &ledger_err),
        None => EngineError::Store(err),
    }
}

/// Finds a violation whether it was raised bare, as an [`InvariantError`]
/// from the checker, or under added context.
pub(crate) fn invariant_violation(err: &anyhow::Error) -> Option<&InvariantViolation> {
    err.downcast_ref::<InvariantViolation>().or_else(|| {
        err.downcast_ref::<InvariantError>()
            .and_then(InvariantError::violation)
    })
}

/// Classifies a pipeline error for the ledger: the invariant name for a
/// violation, otherwise a generic label.
fn error_type(err: &anyhow::Error) -> String {
    if let Some(violation) = invariant_violation(err) {
        return violation.name().as_str().to_string();
    }
    if err.is::<ValidationError>() {
        return "validation_error".to_string();
    }
    "pipeline_error".to_string()
}
