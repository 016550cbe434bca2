use std::fmt::Display;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{now_utc, ValidationError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Success,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceResult {
    Success,
    Failed,
}

impl TraceResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub step: u32,
    pub action: String,
    pub status: StepStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// One persisted attempt. Never updated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    pub trace_id: Ulid,
    pub request_id: String,
    pub orchestrator_name: String,
    pub user_id: Option<String>,
    pub result: TraceResult,
    pub error: Option<String>,
    pub steps: Vec<ExecutionStep>,
    pub total_steps: u32,
    pub input_hash: String,
    pub output_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Opaque reference to a step opened with [`StepTracer::begin`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StepHandle {
    index: usize,
}

impl StepHandle {
    #[must_use]
    pub fn step(self) -> u32 {
        step_number(self.index)
    }
}

#[derive(Debug)]
struct OpenStep {
    index: usize,
    started: Instant,
}

/// Records the ordered steps of one attempt.
///
/// A step number is allocated when the step is entered, so nested steps and
/// manually logged steps share one gapless sequence starting at 1.
#[derive(Debug, Default)]
pub struct StepTracer {
    steps: Vec<ExecutionStep>,
    open: Vec<OpenStep>,
}

fn step_number(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl StepTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, action: impl Into<String>) -> StepHandle {
        let index = self.steps.len();
        self.steps.push(ExecutionStep {
            step: step_number(index),
            action: action.into(),
            status: StepStatus::InProgress,
            started_at: now_utc(),
            completed_at: None,
            duration_ms: None,
            details: None,
            error: None,
        });
        self.open.push(OpenStep {
            index,
            started: Instant::now(),
        });
        StepHandle { index }
    }

    pub fn annotate(&mut self, handle: StepHandle, details: Value) {
        if let Some(step) = self.steps.get_mut(handle.index) {
            step.details = Some(details);
        }
    }

    /// Attaches details to the innermost running step. Returns `false` when no
    /// step is running.
    pub fn annotate_current(&mut self, details: Value) -> bool {
        match self.open.last().map(|open| open.index) {
            Some(index) => {
                self.annotate(StepHandle { index }, details);
                true
            }
            None => false,
        }
    }

    pub fn succeed(&mut self, handle: StepHandle) {
        self.close(handle, StepStatus::Success, None);
    }

    pub fn fail(&mut self, handle: StepHandle, error: impl Into<String>) {
        self.close(handle, StepStatus::Failed, Some(error.into()));
    }

    fn close(&mut self, handle: StepHandle, status: StepStatus, error: Option<String>) {
        let Some(position) = self.open.iter().rposition(|open| open.index == handle.index) else {
            return;
        };
        let open = self.open.remove(position);
        if let Some(step) = self.steps.get_mut(open.index) {
            step.status = status;
            step.completed_at = Some(now_utc());
            step.duration_ms = Some(elapsed_ms(open.started));
            step.error = error;
        }
    }

    /// Appends an already-finished step and returns its number.
    ///
    /// # Errors
    /// Returns [`ValidationError::LoggedStepInProgress`] for
    /// [`StepStatus::InProgress`]; a running step must come from
    /// [`StepTracer::begin`] so it can be closed.
    pub fn log_step(
        &mut self,
        action: impl Into<String>,
        status: StepStatus,
        details: Option<Value>,
    ) -> Result<u32, ValidationError> {
        let action = action.into();
        if status == StepStatus::InProgress {
            return Err(ValidationError::LoggedStepInProgress { action });
        }
        let index = self.steps.len();
        let now = now_utc();
        self.steps.push(ExecutionStep {
            step: step_number(index),
            action,
            status,
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
            details,
            error: None,
        });
        Ok(step_number(index))
    }

    /// Runs `f` as one step: success on `Ok`, failed with the error message on
    /// `Err`. The error is returned unchanged.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn trace<T, E, F>(&mut self, action: impl Into<String>, f: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let handle = self.begin(action);
        match f(self) {
            Ok(value) => {
                self.succeed(handle);
                Ok(value)
            }
            Err(err) => {
                self.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    /// Marks every still-running step as failed, innermost first.
    pub fn abandon_open(&mut self, error: &str) {
        while let Some(open) = self.open.last() {
            let handle = StepHandle { index: open.index };
            self.fail(handle, error);
        }
    }

    #[must_use]
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    #[must_use]
    pub fn open_steps(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn into_steps(self) -> Vec<ExecutionStep> {
        self.steps
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("trace {trace_id} is incomplete: {}", .issues.join("; "))]
pub struct TraceValidationError {
    pub trace_id: String,
    pub issues: Vec<String>,
}

/// Ordering problems in a step list: numbering must be exactly `1..=n`.
#[must_use]
pub fn step_order_issues(steps: &[ExecutionStep]) -> Vec<String> {
    let mut issues = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        let expected = step_number(index);
        if step.step != expected {
            issues.push(format!(
                "step at position {index} has number {} (expected {expected})",
                step.step
            ));
        }
    }
    issues
}

/// Checks a trace for completeness.
///
/// # Errors
/// Returns [`TraceValidationError`] listing every issue found.
pub fn validate_trace(trace: &ExecutionTrace) -> Result<(), TraceValidationError> {
    let mut issues = Vec::new();

    if trace.request_id.trim().is_empty() {
        issues.push("missing request_id".to_string());
    }
    if trace.orchestrator_name.trim().is_empty() {
        issues.push("missing orchestrator_name".to_string());
    }
    if usize::try_from(trace.total_steps).ok() != Some(trace.steps.len()) {
        issues.push(format!(
            "total_steps is {} but {} steps are recorded",
            trace.total_steps,
            trace.steps.len()
        ));
    }

    issues.extend(step_order_issues(&trace.steps));

    for step in &trace.steps {
        if step.action.trim().is_empty() {
            issues.push(format!("step {} has no action", step.step));
        }
        match step.status {
            StepStatus::InProgress => {
                issues.push(format!("step {} never finished", step.step));
            }
            StepStatus::Success | StepStatus::Failed => {
                if step.completed_at.is_none() || step.duration_ms.is_none() {
                    issues.push(format!("step {} is missing completion timing", step.step));
                }
            }
        }
    }

    match trace.result {
        TraceResult::Failed => {
            if !trace
                .error
                .as_deref()
                .is_some_and(|err| !err.trim().is_empty())
            {
                issues.push("failed trace has no error message".to_string());
            }
            if let Some(last) = trace.steps.last() {
                if last.status != StepStatus::Failed {
                    issues.push(format!(
                        "failed trace ends at step {} with status {}",
                        last.step,
                        last.status.as_str()
                    ));
                }
            }
        }
        TraceResult::Success => {
            if trace.output_hash.is_none() {
                issues.push("successful trace has no output_hash".to_string());
            }
            for step in &trace.steps {
                if step.status == StepStatus::Failed {
                    issues.push(format!("successful trace contains failed step {}", step.step));
                }
            }
        }
    }

    if trace.completed_at < trace.started_at {
        issues.push("completed_at precedes started_at".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(TraceValidationError {
            trace_id: trace.trace_id.to_string(),
            issues,
        })
    }
}
