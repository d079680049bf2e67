//! Error types for the pair scheduler
//!
//! Errors fall into two families: transient store errors, which the
//! controller rate limiter retries, and structural errors, which are
//! retried too but need an operator to look at them when they persist.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A write lost an optimistic-concurrency race
    #[error("Conflict writing {kind} {name}: object was modified")]
    StaleWrite { kind: &'static str, name: String },

    /// An object with the same name already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// A pair is already claimed by a different tenant
    #[error("conflict: pair {pair_label} is already claimed by {owner}")]
    PairConflict { pair_label: String, owner: String },

    /// A structural invariant of the fleet does not hold
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A tenant asks for a size class the sizing configuration does not define
    #[error("could not find size configuration for size {0}")]
    UnknownSizeClass(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer handling error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// Transient errors are expected under eventual consistency and clear up on their own.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => {
                matches!(e.code, 404 | 409 | 429 | 500 | 502 | 503 | 504)
            }
            Error::KubeError(_) => true,
            Error::StaleWrite { .. } | Error::AlreadyExists { .. } | Error::PairConflict { .. } => {
                true
            }
            Error::InvariantViolation(_)
            | Error::UnknownSizeClass(_)
            | Error::ConfigError(_)
            | Error::SerializationError(_)
            | Error::FinalizerError(_) => false,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::StaleWrite { .. } => "stale_write",
            Error::AlreadyExists { .. } => "already_exists",
            Error::PairConflict { .. } => "pair_conflict",
            Error::InvariantViolation(_) => "invariant",
            Error::UnknownSizeClass(_) => "unknown_size",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
