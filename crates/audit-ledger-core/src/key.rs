use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const MAX_REQUEST_ID_LEN: usize = 255;
pub const MAX_ORCHESTRATOR_NAME_LEN: usize = 100;

/// Deduplication identity of one request: unique per orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestKey {
    request_id: String,
    orchestrator_name: String,
}

impl RequestKey {
    /// Builds a validated key.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] when either component is malformed.
    pub fn new(
        request_id: impl Into<String>,
        orchestrator_name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let request_id = request_id.into();
        let orchestrator_name = orchestrator_name.into();
        validate_request_id(&request_id)?;
        validate_orchestrator_name(&orchestrator_name)?;
        Ok(Self {
            request_id,
            orchestrator_name,
        })
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn orchestrator_name(&self) -> &str {
        &self.orchestrator_name
    }
}

impl Display for RequestKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.orchestrator_name, self.request_id)
    }
}

/// Validates a caller-supplied request id (1..=255 characters).
///
/// # Errors
/// Returns [`ValidationError::EmptyRequestId`] or
/// [`ValidationError::RequestIdTooLong`].
pub fn validate_request_id(request_id: &str) -> Result<(), ValidationError> {
    if request_id.is_empty() {
        return Err(ValidationError::EmptyRequestId);
    }

    let len = request_id.chars().count();
    if len > MAX_REQUEST_ID_LEN {
        return Err(ValidationError::RequestIdTooLong {
            len,
            max: MAX_REQUEST_ID_LEN,
        });
    }

    Ok(())
}

/// Validates an orchestrator name (1..=100 alphanumeric or `_` characters).
///
/// # Errors
/// Returns a [`ValidationError`] naming the first rule the name breaks.
pub fn validate_orchestrator_name(orchestrator_name: &str) -> Result<(), ValidationError> {
    if orchestrator_name.is_empty() {
        return Err(ValidationError::EmptyOrchestratorName);
    }

    let len = orchestrator_name.chars().count();
    if len > MAX_ORCHESTRATOR_NAME_LEN {
        return Err(ValidationError::OrchestratorNameTooLong {
            len,
            max: MAX_ORCHESTRATOR_NAME_LEN,
        });
    }

    let has_name_chars = orchestrator_name.chars().any(|ch| ch != '_');
    let charset_ok = orchestrator_name
        .chars()
        .all(|ch| ch == '_' || ch.is_alphanumeric());
    if !has_name_chars || !charset_ok {
        return Err(ValidationError::OrchestratorNameCharset {
            name: orchestrator_name.to_string(),
        });
    }

    Ok(())
}
