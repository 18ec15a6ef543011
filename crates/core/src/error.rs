//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// A user-correctable input problem.
///
/// The `Display` output is the exact message surfaced to API callers, so each
/// variant names the rule that failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("MatchIds of Composite type need to be specified as array")]
    NotAnArray,

    #[error("MatchIds of Composite type need to have a value for at least one column")]
    EmptyCompositeKey,

    #[error("MatchIds of Composite type need to be associated to exactly one Data Mapper")]
    WrongMapperCount,

    #[error("MatchIds of Simple type need to be specified as a single value")]
    SimpleNotScalar,

    #[error("at least one match must be provided")]
    EmptyBatch,

    #[error("page size must be between {min} and {max}, got {got}")]
    PageSize { min: usize, max: usize, got: usize },

    #[error("invalid job setting {field}: {reason}")]
    InvalidOverride { field: &'static str, reason: String },
}

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// The request conflicts with current state (e.g. an active job).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A job status change that the status machine does not allow.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
