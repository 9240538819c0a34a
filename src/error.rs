// src/error.rs
//! Error taxonomy shared by the pipeline stages.
//!
//! Expected outcomes (duplicate, below threshold, scheduled retry) are NOT errors;
//! they are modelled as outcome enums in their stages. What lives here are the
//! failures of downstream calls and of input validation, classified so that the
//! publication state machine can decide between retry and dead-letter.

use std::time::Duration;

use thiserror::Error;

/// How a failed downstream call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout, rate limit, 5xx. Retried with backoff.
    Transient,
    /// Auth failure, malformed recipient, rejected content. Never retried.
    Permanent,
    /// The dependency's circuit breaker refused the call.
    CircuitOpen,
}

/// Implemented by every error that can come back from a guarded downstream call.
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

/// Malformed input or configuration. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("article title is empty")]
    EmptyTitle,
    #[error("invalid language code `{0}` (expected two ASCII letters)")]
    InvalidLanguageCode(String),
    #[error("illegal publication transition {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid<R: Into<String>>(field: &'static str, reason: R) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Fast-fail raised while a dependency is suspected unhealthy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit `{dependency}` is open (retry in {}ms)", retry_after.as_millis())]
pub struct CircuitOpenError {
    pub dependency: String,
    /// Time left until the breaker admits a probe call.
    pub retry_after: Duration,
}

/// Failure of the translation capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("transient translation failure: {0}")]
    Transient(String),
    #[error("permanent translation failure: {0}")]
    Permanent(String),
    /// The backend dropped or mangled an entity placeholder. Retrying may succeed.
    #[error("entity placeholder `{0}` missing from translated text")]
    PlaceholderLost(String),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl Classify for TranslationError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) | Self::PlaceholderLost(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
            Self::CircuitOpen(_) => FailureKind::CircuitOpen,
        }
    }
}

/// Failure of the outbound publish capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("transient publish failure: {0}")]
    Transient(String),
    #[error("permanent publish failure: {0}")]
    Permanent(String),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl Classify for PublishError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
            Self::CircuitOpen(_) => FailureKind::CircuitOpen,
        }
    }
}

impl From<TranslationError> for PublishError {
    fn from(e: TranslationError) -> Self {
        match e {
            TranslationError::CircuitOpen(c) => Self::CircuitOpen(c),
            other => match other.kind() {
                FailureKind::Permanent => Self::Permanent(other.to_string()),
                _ => Self::Transient(other.to_string()),
            },
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write (fingerprint, or one record per article).
    #[error("unique constraint violated: {0}")]
    UniqueViolation(&'static str),
    /// Optimistic concurrency check failed: somebody else updated the row first.
    #[error("stale write to {entity} (expected version {expected})")]
    Conflict { entity: &'static str, expected: u64 },
    #[error("{0} not found")]
    NotFound(String),
    /// Backend unavailable or misbehaving. Retryable.
    #[error("storage backend error during {operation}: {message}")]
    Backend { operation: &'static str, message: String },
}

impl StoreError {
    pub fn backend<M: ToString>(operation: &'static str, message: M) -> Self {
        Self::Backend {
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Conflict { .. })
    }
}

/// Cache failures are never fatal; callers degrade to a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Error surfaced by the pipeline entry points for unexpected conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transient infrastructure error: {0}")]
    TransientInfrastructure(String),
    #[error("permanent infrastructure error: {0}")]
    PermanentInfrastructure(String),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        if e.is_retryable() {
            Self::TransientInfrastructure(e.to_string())
        } else {
            Self::PermanentInfrastructure(e.to_string())
        }
    }
}

impl From<TranslationError> for PipelineError {
    fn from(e: TranslationError) -> Self {
        match e {
            TranslationError::CircuitOpen(c) => Self::CircuitOpen(c),
            other if other.kind() == FailureKind::Permanent => {
                Self::PermanentInfrastructure(other.to_string())
            }
            other => Self::TransientInfrastructure(other.to_string()),
        }
    }
}
