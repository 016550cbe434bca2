use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::InvariantViolation;

/// Every persisted domain entity a pipeline can touch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Owner,
    RawInput,
    Baseline,
    Draft,
    Committed,
    Milestone,
    ProgressEvent,
    Score,
    Snapshot,
}

impl EntityType {
    pub const ALL: [Self; 9] = [
        Self::Owner,
        Self::RawInput,
        Self::Baseline,
        Self::Draft,
        Self::Committed,
        Self::Milestone,
        Self::ProgressEvent,
        Self::Score,
        Self::Snapshot,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::RawInput => "raw_input",
            Self::Baseline => "baseline",
            Self::Draft => "draft",
            Self::Committed => "committed",
            Self::Milestone => "milestone",
            Self::ProgressEvent => "progress_event",
            Self::Score => "score",
            Self::Snapshot => "snapshot",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|entity| entity.as_str() == value)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

fn names(set: &BTreeSet<EntityType>) -> Vec<String> {
    set.iter().map(|entity| entity.as_str().to_string()).collect()
}

/// Entity types a workflow pipeline may write. Reads are unrestricted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WriteGate {
    writes: BTreeSet<EntityType>,
}

impl WriteGate {
    pub fn new(writes: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            writes: writes.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn permits(&self, entity: EntityType) -> bool {
        self.writes.contains(&entity)
    }

    /// # Errors
    /// Returns [`InvariantViolation::WriteNotPermitted`] when `entity` is not
    /// in the gate.
    pub fn check(&self, operation: &str, entity: EntityType) -> Result<(), InvariantViolation> {
        if self.permits(entity) {
            return Ok(());
        }
        Err(InvariantViolation::WriteNotPermitted {
            operation: operation.to_string(),
            entity_type: entity.as_str().to_string(),
            allowed_writes: names(&self.writes),
        })
    }
}

/// Read-only capability for a reporting pipeline: reads from an allow-list,
/// writes only its own snapshot type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReportingAccess {
    operation: String,
    reads: BTreeSet<EntityType>,
    snapshot_type: EntityType,
}

impl ReportingAccess {
    pub fn new(
        operation: impl Into<String>,
        reads: impl IntoIterator<Item = EntityType>,
        snapshot_type: EntityType,
    ) -> Self {
        Self {
            operation: operation.into(),
            reads: reads.into_iter().collect(),
            snapshot_type,
        }
    }

    /// The allow-list used by progress analytics: committed lifecycle data
    /// and drafts in, one snapshot out.
    #[must_use]
    pub fn analytics(operation: impl Into<String>) -> Self {
        Self::new(
            operation,
            [
                EntityType::Owner,
                EntityType::Draft,
                EntityType::Committed,
                EntityType::Milestone,
                EntityType::ProgressEvent,
                EntityType::Score,
            ],
            EntityType::Snapshot,
        )
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn snapshot_type(&self) -> EntityType {
        self.snapshot_type
    }

    #[must_use]
    pub fn permits(&self, entity: EntityType, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.reads.contains(&entity),
            AccessMode::Write => entity == self.snapshot_type,
        }
    }

    /// # Errors
    /// Returns [`InvariantViolation::ReportingIsReadOnly`] naming the
    /// offending type and both allow-lists.
    pub fn check(&self, entity: EntityType, mode: AccessMode) -> Result<(), InvariantViolation> {
        if self.permits(entity, mode) {
            return Ok(());
        }
        Err(InvariantViolation::ReportingIsReadOnly {
            operation: self.operation.clone(),
            accessed_type: entity.as_str().to_string(),
            mode,
            allowed_reads: names(&self.reads),
            allowed_writes: vec![self.snapshot_type.as_str().to_string()],
        })
    }
}

/// Capability handed to a pipeline for its domain session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AccessPolicy {
    Workflow(WriteGate),
    Reporting(ReportingAccess),
}

impl AccessPolicy {
    pub fn workflow(writes: impl IntoIterator<Item = EntityType>) -> Self {
        Self::Workflow(WriteGate::new(writes))
    }

    pub fn reporting(
        operation: impl Into<String>,
        reads: impl IntoIterator<Item = EntityType>,
        snapshot_type: EntityType,
    ) -> Self {
        Self::Reporting(ReportingAccess::new(operation, reads, snapshot_type))
    }

    /// Workflow that may read and write everything.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self::workflow(EntityType::ALL)
    }

    #[must_use]
    pub fn is_reporting(&self) -> bool {
        matches!(self, Self::Reporting(_))
    }

    /// Asks the policy before touching `entity`.
    ///
    /// # Errors
    /// Returns the violation the capability raises for this access.
    pub fn check(
        &self,
        operation: &str,
        entity: EntityType,
        mode: AccessMode,
    ) -> Result<(), InvariantViolation> {
        match (self, mode) {
            (Self::Workflow(_), AccessMode::Read) => Ok(()),
            (Self::Workflow(gate), AccessMode::Write) => gate.check(operation, entity),
            (Self::Reporting(access), _) => access.check(entity, mode),
        }
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::unrestricted()
    }
}
