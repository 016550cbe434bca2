use anyhow::{Context as _, Result};
use audit_ledger_core::{
    AccessPolicy, EvidenceCollector, EvidenceInput, EvidenceItem, ExecutionStep, InvariantChecker,
    RequestKey, ResourceRef, StepStatus, StepTracer, ValidationError,
};
use audit_ledger_store_sqlite::{Provenance, SqliteLifecycleReader};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::session::DomainSession;

/// Handles a pipeline gets for one attempt.
///
/// Lives only while the pipeline runs; the engine takes the recorded steps,
/// evidence and result resource back when it returns.
pub struct ExecutionContext<'a> {
    key: &'a RequestKey,
    payload: &'a Value,
    user_id: Option<&'a str>,
    tracer: StepTracer,
    evidence: EvidenceCollector,
    reader: SqliteLifecycleReader<'a>,
    domain: DomainSession<'a>,
    result_resource: Option<ResourceRef>,
}

#[derive(Default)]
pub(crate) struct AttemptRecord {
    pub steps: Vec<ExecutionStep>,
    pub evidence: EvidenceCollector,
    pub result_resource: Option<ResourceRef>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        conn: &'a Connection,
        key: &'a RequestKey,
        payload: &'a Value,
        user_id: Option<&'a str>,
        policy: AccessPolicy,
    ) -> Self {
        let provenance = Provenance {
            request_id: key.request_id(),
            orchestrator_name: key.orchestrator_name(),
        };
        Self {
            key,
            payload,
            user_id,
            tracer: StepTracer::new(),
            evidence: EvidenceCollector::new(),
            reader: SqliteLifecycleReader::new(conn),
            domain: DomainSession::new(conn, policy, provenance),
            result_resource: None,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        self.key.request_id()
    }

    #[must_use]
    pub fn orchestrator_name(&self) -> &str {
        self.key.orchestrator_name()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        self.payload
    }

    /// Deserializes the payload into the pipeline's input type.
    ///
    /// # Errors
    /// Returns an error if the payload does not have the expected shape.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("payload for {} has an unexpected shape", self.key))
    }

    /// Runs `f` as the next numbered step. The step is marked failed with
    /// the error message when `f` fails, and the error is returned unchanged.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn trace_step<T, F>(&mut self, action: impl Into<String>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let handle = self.tracer.begin(action);
        match f(self) {
            Ok(value) => {
                self.tracer.succeed(handle);
                Ok(value)
            }
            Err(err) => {
                self.tracer.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    /// Attaches details to the innermost running step. Returns `false`
    /// outside a step.
    pub fn set_step_details(&mut self, details: Value) -> bool {
        self.tracer.annotate_current(details)
    }

    /// Appends an already-finished step and returns its number.
    ///
    /// # Errors
    /// Returns [`ValidationError::LoggedStepInProgress`] for
    /// [`StepStatus::InProgress`]; use [`ExecutionContext::trace_step`] for
    /// work that is still running.
    pub fn log_step(
        &mut self,
        action: impl Into<String>,
        status: StepStatus,
        details: Option<Value>,
    ) -> Result<u32, ValidationError> {
        self.tracer.log_step(action, status, details)
    }

    #[must_use]
    pub fn steps(&self) -> &[ExecutionStep] {
        self.tracer.steps()
    }

    /// # Errors
    /// Returns [`ValidationError`] for a blank type or a confidence outside
    /// `[0, 1]`.
    pub fn add_evidence(&mut self, input: EvidenceInput) -> Result<&EvidenceItem, ValidationError> {
        self.evidence.add(input)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceItem] {
        self.evidence.items()
    }

    #[must_use]
    pub fn invariants(&self) -> InvariantChecker<'_> {
        InvariantChecker::new(&self.reader)
    }

    #[must_use]
    pub fn domain(&self) -> &DomainSession<'a> {
        &self.domain
    }

    /// Names the primary resource this attempt produced; stored on the
    /// COMPLETED ledger record.
    pub fn set_result_resource(
        &mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) {
        self.result_resource = Some(ResourceRef {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        });
    }

    pub(crate) fn finish(mut self, abandon_error: Option<&str>) -> AttemptRecord {
        if let Some(error) = abandon_error {
            self.tracer.abandon_open(error);
        }
        AttemptRecord {
            steps: self.tracer.into_steps(),
            evidence: self.evidence,
            result_resource: self.result_resource,
        }
    }
}
