use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{now_utc, ValidationError};

/// Evidence as supplied by a pipeline, before it is timestamped.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceInput {
    pub evidence_type: String,
    pub data: Value,
    pub source: Option<String>,
    pub confidence: Option<f64>,
    pub metadata: Option<Value>,
}

impl EvidenceInput {
    #[must_use]
    pub fn new(evidence_type: impl Into<String>, data: Value) -> Self {
        Self {
            evidence_type: evidence_type.into(),
            data,
            source: None,
            confidence: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    #[serde(rename = "type")]
    pub evidence_type: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceBundle {
    pub bundle_id: Ulid,
    pub trace_id: Ulid,
    pub items: Vec<EvidenceItem>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only evidence buffer for one attempt.
#[derive(Debug, Clone, Default)]
pub struct EvidenceCollector {
    items: Vec<EvidenceItem>,
}

impl EvidenceCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamps and appends one item.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyEvidenceType`] for a blank type and
    /// [`ValidationError::ConfidenceOutOfRange`] for a confidence outside
    /// `[0.0, 1.0]`. Nothing is appended on error.
    pub fn add(&mut self, input: EvidenceInput) -> Result<&EvidenceItem, ValidationError> {
        if input.evidence_type.trim().is_empty() {
            return Err(ValidationError::EmptyEvidenceType);
        }
        if let Some(confidence) = input.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ValidationError::ConfidenceOutOfRange(confidence));
            }
        }

        let index = self.items.len();
        self.items.push(EvidenceItem {
            evidence_type: input.evidence_type,
            data: input.data,
            timestamp: now_utc(),
            source: input.source,
            confidence: input.confidence,
            metadata: input.metadata,
        });
        Ok(&self.items[index])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    /// Seals the buffer. An empty collector produces no bundle.
    #[must_use]
    pub fn into_bundle(self, trace_id: Ulid, metadata: Value) -> Option<EvidenceBundle> {
        if self.items.is_empty() {
            return None;
        }
        Some(EvidenceBundle {
            bundle_id: Ulid::new(),
            trace_id,
            items: self.items,
            metadata,
            created_at: now_utc(),
        })
    }
}
