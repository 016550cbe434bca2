//! Cross-entity lifecycle guards.
//!
//! Every check reads through a [`LifecycleReader`] and either returns or
//! raises; none of them write. A failed read surfaces as
//! [`InvariantError::Read`], never as a violation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AccessMode, EntityType, ReportingAccess};

/// Minimum number of answered items before a score may be recorded.
pub const MIN_SCORING_ITEM_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvariantName {
    CommittedHasPredecessor,
    TrackingTargetIsCommitted,
    ScoringRequiresExplicitSubmission,
    ReportingRequiresCommittedPredecessor,
    ReportingIsReadOnly,
    WriteNotPermitted,
}

impl InvariantName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CommittedHasPredecessor => "committed_has_predecessor",
            Self::TrackingTargetIsCommitted => "tracking_target_is_committed",
            Self::ScoringRequiresExplicitSubmission => "scoring_requires_explicit_submission",
            Self::ReportingRequiresCommittedPredecessor => {
                "reporting_requires_committed_predecessor"
            }
            Self::ReportingIsReadOnly => "reporting_is_read_only",
            Self::WriteNotPermitted => "write_not_permitted",
        }
    }
}

impl std::fmt::Display for InvariantName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum InvariantViolation {
    #[error("cannot commit: no draft id provided for owner {owner_id}")]
    PredecessorNotProvided { owner_id: String },
    #[error("cannot commit: draft {draft_id} not found or not owned by {owner_id}")]
    PredecessorNotFound { draft_id: String, owner_id: String },
    #[error("cannot commit: draft {draft_id} already committed as {committed_id}")]
    PredecessorAlreadyCommitted {
        draft_id: String,
        owner_id: String,
        committed_id: String,
    },
    #[error("cannot track progress: milestone {milestone_id} not found")]
    TrackingTargetNotFound {
        milestone_id: String,
        owner_id: String,
    },
    #[error("cannot track progress: milestone {milestone_id} is not part of a committed record")]
    TrackingTargetNotCommitted {
        milestone_id: String,
        owner_id: String,
        draft_id: Option<String>,
    },
    #[error("cannot track progress: committed record {committed_id} is owned by {committed_owner_id}, not {owner_id}")]
    TrackingTargetOwnershipMismatch {
        milestone_id: String,
        owner_id: String,
        committed_id: String,
        committed_owner_id: String,
    },
    #[error("cannot score for {owner_id}: submission was not explicit")]
    ScoringNotExplicit { owner_id: String },
    #[error("cannot score for {owner_id}: insufficient items (got {item_count}, need at least {minimum})")]
    ScoringInsufficientItems {
        owner_id: String,
        item_count: usize,
        minimum: usize,
    },
    #[error("cannot report for {owner_id}: no committed predecessor{}", .predecessor_id.as_ref().map(|id| format!(" {id}")).unwrap_or_default())]
    ReportingWithoutCommittedPredecessor {
        owner_id: String,
        predecessor_id: Option<String>,
    },
    #[error("{operation} may not {} {accessed_type} (reads: {}; writes: {})", .mode.as_str(), .allowed_reads.join(", "), .allowed_writes.join(", "))]
    ReportingIsReadOnly {
        operation: String,
        accessed_type: String,
        mode: AccessMode,
        allowed_reads: Vec<String>,
        allowed_writes: Vec<String>,
    },
    #[error("{operation} may not write {entity_type} (allowed: {})", .allowed_writes.join(", "))]
    WriteNotPermitted {
        operation: String,
        entity_type: String,
        allowed_writes: Vec<String>,
    },
}

impl InvariantViolation {
    #[must_use]
    pub fn name(&self) -> InvariantName {
        match self {
            Self::PredecessorNotProvided { .. }
            | Self::PredecessorNotFound { .. }
            | Self::PredecessorAlreadyCommitted { .. } => InvariantName::CommittedHasPredecessor,
            Self::TrackingTargetNotFound { .. }
            | Self::TrackingTargetNotCommitted { .. }
            | Self::TrackingTargetOwnershipMismatch { .. } => {
                InvariantName::TrackingTargetIsCommitted
            }
            Self::ScoringNotExplicit { .. } | Self::ScoringInsufficientItems { .. } => {
                InvariantName::ScoringRequiresExplicitSubmission
            }
            Self::ReportingWithoutCommittedPredecessor { .. } => {
                InvariantName::ReportingRequiresCommittedPredecessor
            }
            Self::ReportingIsReadOnly { .. } => InvariantName::ReportingIsReadOnly,
            Self::WriteNotPermitted { .. } => InvariantName::WriteNotPermitted,
        }
    }

    /// Offending identifiers as a JSON object.
    #[must_use]
    pub fn details(&self) -> Value {
        match self {
            Self::PredecessorNotProvided { owner_id } => {
                json!({"owner_id": owner_id, "draft_id": null})
            }
            Self::PredecessorNotFound { draft_id, owner_id } => {
                json!({"owner_id": owner_id, "draft_id": draft_id, "exists": false})
            }
            Self::PredecessorAlreadyCommitted {
                draft_id,
                owner_id,
                committed_id,
            } => json!({
                "owner_id": owner_id,
                "draft_id": draft_id,
                "existing_committed_id": committed_id,
                "already_committed": true,
            }),
            Self::TrackingTargetNotFound {
                milestone_id,
                owner_id,
            } => json!({"owner_id": owner_id, "milestone_id": milestone_id, "exists": false}),
            Self::TrackingTargetNotCommitted {
                milestone_id,
                owner_id,
                draft_id,
            } => json!({
                "owner_id": owner_id,
                "milestone_id": milestone_id,
                "draft_id": draft_id,
                "committed_id": null,
            }),
            Self::TrackingTargetOwnershipMismatch {
                milestone_id,
                owner_id,
                committed_id,
                committed_owner_id,
            } => json!({
                "owner_id": owner_id,
                "milestone_id": milestone_id,
                "committed_id": committed_id,
                "committed_owner_id": committed_owner_id,
                "ownership_mismatch": true,
            }),
            Self::ScoringNotExplicit { owner_id } => {
                json!({"owner_id": owner_id, "is_explicit_submission": false})
            }
            Self::ScoringInsufficientItems {
                owner_id,
                item_count,
                minimum,
            } => json!({
                "owner_id": owner_id,
                "item_count": item_count,
                "minimum_required": minimum,
            }),
            Self::ReportingWithoutCommittedPredecessor {
                owner_id,
                predecessor_id,
            } => json!({"owner_id": owner_id, "predecessor_id": predecessor_id}),
            Self::ReportingIsReadOnly {
                operation,
                accessed_type,
                mode,
                allowed_reads,
                allowed_writes,
            } => json!({
                "operation": operation,
                "accessed_type": accessed_type,
                "mode": mode.as_str(),
                "allowed_reads": allowed_reads,
                "allowed_writes": allowed_writes,
            }),
            Self::WriteNotPermitted {
                operation,
                entity_type,
                allowed_writes,
            } => json!({
                "operation": operation,
                "entity_type": entity_type,
                "allowed_writes": allowed_writes,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error(transparent)]
    Violation(#[from] InvariantViolation),
    #[error(transparent)]
    Read(#[from] anyhow::Error),
}

impl InvariantError {
    #[must_use]
    pub fn violation(&self) -> Option<&InvariantViolation> {
        match self {
            Self::Violation(violation) => Some(violation),
            Self::Read(_) => None,
        }
    }
}

/// Where a milestone currently lives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MilestonePlacement {
    pub milestone_id: String,
    pub draft_id: Option<String>,
    pub committed_id: Option<String>,
}

/// Read access to lifecycle state needed by the guards.
pub trait LifecycleReader {
    #[allow(clippy::missing_errors_doc)]
    fn draft_owner(&self, draft_id: &str) -> anyhow::Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn committed_for_draft(&self, draft_id: &str) -> anyhow::Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn committed_owner(&self, committed_id: &str) -> anyhow::Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_committed_for_owner(&self, owner_id: &str) -> anyhow::Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn milestone_placement(&self, milestone_id: &str)
        -> anyhow::Result<Option<MilestonePlacement>>;
}

/// A transition into the committed state must name an existing, owned,
/// not-yet-committed draft.
///
/// # Errors
/// Returns a `committed_has_predecessor` violation or a read failure.
pub fn check_committed_has_predecessor(
    reader: &dyn LifecycleReader,
    draft_id: Option<&str>,
    owner_id: &str,
) -> Result<(), InvariantError> {
    let Some(draft_id) = draft_id else {
        return Err(InvariantViolation::PredecessorNotProvided {
            owner_id: owner_id.to_string(),
        }
        .into());
    };

    if reader.draft_owner(draft_id)?.as_deref() != Some(owner_id) {
        return Err(InvariantViolation::PredecessorNotFound {
            draft_id: draft_id.to_string(),
            owner_id: owner_id.to_string(),
        }
        .into());
    }

    if let Some(committed_id) = reader.committed_for_draft(draft_id)? {
        return Err(InvariantViolation::PredecessorAlreadyCommitted {
            draft_id: draft_id.to_string(),
            owner_id: owner_id.to_string(),
            committed_id,
        }
        .into());
    }

    Ok(())
}

/// Progress may only be tracked against a milestone of the owner's committed
/// record; a draft milestone is rejected.
///
/// # Errors
/// Returns a `tracking_target_is_committed` violation or a read failure.
pub fn check_tracking_target_is_committed(
    reader: &dyn LifecycleReader,
    milestone_id: &str,
    owner_id: &str,
) -> Result<(), InvariantError> {
    let Some(placement) = reader.milestone_placement(milestone_id)? else {
        return Err(InvariantViolation::TrackingTargetNotFound {
            milestone_id: milestone_id.to_string(),
            owner_id: owner_id.to_string(),
        }
        .into());
    };

    let committed_owner = match &placement.committed_id {
        Some(committed_id) => reader
            .committed_owner(committed_id)?
            .map(|owner| (committed_id.clone(), owner)),
        None => None,
    };
    let Some((committed_id, committed_owner_id)) = committed_owner else {
        return Err(InvariantViolation::TrackingTargetNotCommitted {
            milestone_id: milestone_id.to_string(),
            owner_id: owner_id.to_string(),
            draft_id: placement.draft_id,
        }
        .into());
    };

    if committed_owner_id != owner_id {
        return Err(InvariantViolation::TrackingTargetOwnershipMismatch {
            milestone_id: milestone_id.to_string(),
            owner_id: owner_id.to_string(),
            committed_id,
            committed_owner_id,
        }
        .into());
    }

    Ok(())
}

/// Terminal scoring needs an explicit submission of at least
/// [`MIN_SCORING_ITEM_COUNT`] items.
///
/// # Errors
/// Returns a `scoring_requires_explicit_submission` violation.
pub fn check_scoring_requires_submission(
    owner_id: &str,
    item_count: usize,
    explicit: bool,
) -> Result<(), InvariantViolation> {
    if !explicit {
        return Err(InvariantViolation::ScoringNotExplicit {
            owner_id: owner_id.to_string(),
        });
    }
    if item_count < MIN_SCORING_ITEM_COUNT {
        return Err(InvariantViolation::ScoringInsufficientItems {
            owner_id: owner_id.to_string(),
            item_count,
            minimum: MIN_SCORING_ITEM_COUNT,
        });
    }
    Ok(())
}

/// Resolves the committed record a report is built on: the named one if it
/// belongs to the owner, otherwise the owner's latest.
///
/// # Errors
/// Returns a `reporting_requires_committed_predecessor` violation or a read
/// failure.
pub fn check_reporting_has_committed_predecessor(
    reader: &dyn LifecycleReader,
    owner_id: &str,
    predecessor_id: Option<&str>,
) -> Result<String, InvariantError> {
    let resolved = match predecessor_id {
        Some(committed_id) => reader
            .committed_owner(committed_id)?
            .filter(|owner| owner == owner_id)
            .map(|_| committed_id.to_string()),
        None => reader.latest_committed_for_owner(owner_id)?,
    };

    resolved.ok_or_else(|| {
        InvariantViolation::ReportingWithoutCommittedPredecessor {
            owner_id: owner_id.to_string(),
            predecessor_id: predecessor_id.map(str::to_string),
        }
        .into()
    })
}

/// # Errors
/// Returns a `reporting_is_read_only` violation when `access` does not allow
/// this access.
pub fn check_reporting_is_read_only(
    access: &ReportingAccess,
    accessed_type: EntityType,
    mode: AccessMode,
) -> Result<(), InvariantViolation> {
    access.check(accessed_type, mode)
}

/// One invariant check with its arguments.
#[derive(Debug, Clone, Copy)]
pub enum InvariantCheck<'a> {
    CommittedHasPredecessor {
        draft_id: Option<&'a str>,
        owner_id: &'a str,
    },
    TrackingTargetIsCommitted {
        milestone_id: &'a str,
        owner_id: &'a str,
    },
    ScoringRequiresSubmission {
        owner_id: &'a str,
        item_count: usize,
        explicit: bool,
    },
    ReportingHasCommittedPredecessor {
        owner_id: &'a str,
        predecessor_id: Option<&'a str>,
    },
    ReportingIsReadOnly {
        access: &'a ReportingAccess,
        accessed_type: EntityType,
        mode: AccessMode,
    },
}

impl InvariantCheck<'_> {
    #[must_use]
    pub fn name(&self) -> InvariantName {
        match self {
            Self::CommittedHasPredecessor { .. } => InvariantName::CommittedHasPredecessor,
            Self::TrackingTargetIsCommitted { .. } => InvariantName::TrackingTargetIsCommitted,
            Self::ScoringRequiresSubmission { .. } => {
                InvariantName::ScoringRequiresExplicitSubmission
            }
            Self::ReportingHasCommittedPredecessor { .. } => {
                InvariantName::ReportingRequiresCommittedPredecessor
            }
            Self::ReportingIsReadOnly { .. } => InvariantName::ReportingIsReadOnly,
        }
    }
}

/// Dispatches [`InvariantCheck`]s against one reader.
#[derive(Clone, Copy)]
pub struct InvariantChecker<'r> {
    reader: &'r dyn LifecycleReader,
}

impl<'r> InvariantChecker<'r> {
    #[must_use]
    pub fn new(reader: &'r dyn LifecycleReader) -> Self {
        Self { reader }
    }

    /// # Errors
    /// Returns the violation or read failure raised by the check.
    pub fn check(&self, check: &InvariantCheck<'_>) -> Result<(), InvariantError> {
        match *check {
            InvariantCheck::CommittedHasPredecessor { draft_id, owner_id } => {
                check_committed_has_predecessor(self.reader, draft_id, owner_id)
            }
            InvariantCheck::TrackingTargetIsCommitted {
                milestone_id,
                owner_id,
            } => check_tracking_target_is_committed(self.reader, milestone_id, owner_id),
            InvariantCheck::ScoringRequiresSubmission {
                owner_id,
                item_count,
                explicit,
            } => check_scoring_requires_submission(owner_id, item_count, explicit)
                .map_err(InvariantError::from),
            InvariantCheck::ReportingHasCommittedPredecessor {
                owner_id,
                predecessor_id,
            } => check_reporting_has_committed_predecessor(self.reader, owner_id, predecessor_id)
                .map(|_| ()),
            InvariantCheck::ReportingIsReadOnly {
                access,
                accessed_type,
                mode,
            } => check_reporting_is_read_only(access, accessed_type, mode)
                .map_err(InvariantError::from),
        }
    }

    /// Runs checks in order and stops at the first failure.
    ///
    /// # Errors
    /// Returns the first violation or read failure.
    pub fn check_all(&self, checks: &[InvariantCheck<'_>]) -> Result<(), InvariantError> {
        for check in checks {
            self.check(check)?;
        }
        Ok(())
    }

    /// # Errors
    /// See [`check_committed_has_predecessor`].
    pub fn committed_has_predecessor(
        &self,
        draft_id: Option<&str>,
        owner_id: &str,
    ) -> Result<(), InvariantError> {
        check_committed_has_predecessor(self.reader, draft_id, owner_id)
    }

    /// # Errors
    /// See [`check_tracking_target_is_committed`].
    pub fn tracking_target_is_committed(
        &self,
        milestone_id: &str,
        owner_id: &str,
    ) -> Result<(), InvariantError> {
        check_tracking_target_is_committed(self.reader, milestone_id, owner_id)
    }

    /// # Errors
    /// See [`check_reporting_has_committed_predecessor`].
    pub fn reporting_has_committed_predecessor(
        &self,
        owner_id: &str,
        predecessor_id: Option<&str>,
    ) -> Result<String, InvariantError> {
        check_reporting_has_committed_predecessor(self.reader, owner_id, predecessor_id)
    }
}
