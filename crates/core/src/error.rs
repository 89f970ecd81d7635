//! Domain error model.

use thiserror::Error;

use crate::queue::QueueStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A persisted status label could not be decoded.
    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// A queue status transition that the domain refuses to apply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The transition is not part of the queue state machine.
    #[error("invalid queue transition {from} -> {to}")]
    Invalid { from: QueueStatus, to: QueueStatus },

    /// Re-running a finished entry needs an explicit reprocess request.
    #[error("queue entry is done; reprocessing requires an explicit reprocess flag")]
    ReprocessNotRequested,

    /// A run that processed nothing cannot be recorded as a success.
    #[error("refusing to complete a run with zero processed items")]
    ZeroItems,

    /// The entry has moved on to another run since this one started.
    #[error("queue entry no longer belongs to this run")]
    StaleRun,
}
