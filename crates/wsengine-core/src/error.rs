//! Error types shared by every wsengine crate.

use thiserror::Error;

use crate::job::JobStatus;
use crate::types::EntityKind;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while handling events or evaluating policies.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A foreign key points at an entity that does not exist.
    #[error("invalid reference: {kind} {id} ({detail})")]
    InvalidReference {
        kind: EntityKind,
        id: String,
        detail: String,
    },

    #[error("invalid job status transition for {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("not found: {kind} {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Selector match or policy rule evaluation failure.
    #[error("evaluator error: {0}")]
    Evaluator(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Event payload rejected at the intake boundary.
    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_reference(
        kind: EntityKind,
        id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::InvalidReference {
            kind,
            id: id.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_payload(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable label, used in logs and evaluation records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidReference { .. } => "invalid_reference",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::NotFound { .. } => "not_found",
            Self::Evaluator(_) => "evaluator_error",
            Self::Persistence(_) => "persistence_error",
            Self::Cancelled => "cancelled",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::UnsupportedEvent(_) => "unsupported_event",
        }
    }
}
