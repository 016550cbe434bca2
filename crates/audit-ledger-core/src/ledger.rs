use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{RequestKey, ValidationError};

/// Ten years. `expires_at` is informational, so anything longer is a caller
/// mistake rather than a meaningful retention.
pub const MAX_TTL_HOURS: u32 = 24 * 365 * 10;

/// # Errors
/// Returns [`ValidationError::TtlOutOfRange`] above [`MAX_TTL_HOURS`].
pub fn validate_ttl_hours(ttl_hours: u32) -> Result<(), ValidationError> {
    if ttl_hours > MAX_TTL_HOURS {
        return Err(ValidationError::TtlOutOfRange {
            ttl_hours,
            max: MAX_TTL_HOURS,
        });
    }
    Ok(())
}

/// `created_at + ttl_hours`, checked.
///
/// # Errors
/// Returns [`ValidationError::TtlOutOfRange`] when the ttl is rejected by
/// [`validate_ttl_hours`] or the sum leaves the representable range.
pub fn expires_at(
    created_at: OffsetDateTime,
    ttl_hours: u32,
) -> Result<OffsetDateTime, ValidationError> {
    validate_ttl_hours(ttl_hours)?;
    created_at
        .checked_add(Duration::hours(i64::from(ttl_hours)))
        .ok_or(ValidationError::TtlOutOfRange {
            ttl_hours,
            max: MAX_TTL_HOURS,
        })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `PENDING -> PROCESSING -> {COMPLETED, FAILED}`; nothing leaves a
    /// terminal state. A FAILED record is replaced, never transitioned.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }

    /// Validates a single transition.
    ///
    /// # Errors
    /// Returns [`LedgerError::IllegalTransition`] for any edge outside the
    /// lifecycle.
    pub fn ensure_transition(self, next: Self) -> Result<(), LedgerError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(LedgerError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("illegal ledger transition {from} -> {to}")]
    IllegalTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("ledger record {key} is COMPLETED but has no cached response")]
    CompletedWithoutResponse { key: String },
    #[error("ledger record {key} is in unexpected state {status}")]
    UnexpectedStatus { key: String, status: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorDetails {
    pub error_type: String,
    pub error_message: String,
}

/// Primary resource produced by a completed request.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerRecord {
    pub request_id: String,
    pub orchestrator_name: String,
    pub user_id: Option<String>,
    pub status: RequestStatus,
    pub payload: Value,
    pub payload_hash: String,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub result_resource: Option<ResourceRef>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Stored for operators; nothing in the engine reads it.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// What the engine must do with a record found at lookup or claim time.
#[derive(Debug, Clone, PartialEq)]
pub enum ExistingDisposition {
    ReturnCached(Value),
    InFlight,
    RetryAfterFailure,
}

impl LedgerRecord {
    #[must_use]
    pub fn key_label(&self) -> String {
        format!("{}/{}", self.orchestrator_name, self.request_id)
    }

    #[must_use]
    pub fn matches(&self, key: &RequestKey) -> bool {
        self.request_id == key.request_id() && self.orchestrator_name == key.orchestrator_name()
    }

    /// Returns the cached response of a COMPLETED record.
    ///
    /// # Errors
    /// Returns [`LedgerError::CompletedWithoutResponse`] when the record is
    /// COMPLETED without a response, and [`LedgerError::UnexpectedStatus`]
    /// when the record is not COMPLETED at all.
    pub fn cached_response(&self) -> Result<&Value, LedgerError> {
        if self.status != RequestStatus::Completed {
            return Err(LedgerError::UnexpectedStatus {
                key: self.key_label(),
                status: self.status.as_str().to_string(),
            });
        }
        self.response
            .as_ref()
            .ok_or_else(|| LedgerError::CompletedWithoutResponse {
                key: self.key_label(),
            })
    }

    /// Classifies an existing record for a new call with the same key.
    ///
    /// PENDING is never visible outside the claim transaction, so observing
    /// it is a consistency error.
    ///
    /// # Errors
    /// Returns [`LedgerError`] for COMPLETED-without-response and PENDING.
    pub fn disposition(&self) -> Result<ExistingDisposition, LedgerError> {
        match self.status {
            RequestStatus::Completed => {
                Ok(ExistingDisposition::ReturnCached(self.cached_response()?.clone()))
            }
            RequestStatus::Processing => Ok(ExistingDisposition::InFlight),
            RequestStatus::Failed => Ok(ExistingDisposition::RetryAfterFailure),
            RequestStatus::Pending => Err(LedgerError::UnexpectedStatus {
                key: self.key_label(),
                status: self.status.as_str().to_string(),
            }),
        }
    }
}
