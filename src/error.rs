//! Error types for the mock engine.

use crate::config::MockType;
use thiserror::Error;

/// A definition was rejected at mutation time.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{context}: `{first}` and `{second}` are mutually exclusive")]
    MutuallyExclusive {
        context: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("{context}: one of {options} is required")]
    MissingOneOf {
        context: &'static str,
        options: &'static str,
    },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid QoS {0}, expected 0, 1 or 2")]
    InvalidQos(u8),

    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("mock declares type {declared} but carries a {actual} payload")]
    TypeMismatch { declared: MockType, actual: MockType },

    #[error("mock of type {0} carries more than one protocol payload")]
    AmbiguousPayload(MockType),

    #[error("{0}")]
    Invalid(String),
}

/// Failure of a stateful CRUD dispatch.
#[derive(Debug, Error)]
pub enum StatefulError {
    #[error("stateful resource {0:?} not found")]
    ResourceNotFound(String),

    #[error("record {id:?} not found in {resource:?}")]
    RecordNotFound { resource: String, id: String },

    #[error("a record id is required for {0}")]
    MissingId(&'static str),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("record {id:?} already exists in {resource:?}")]
    Conflict { resource: String, id: String },

    #[error("custom operation {0:?} has no registered handler")]
    CustomUnavailable(String),

    #[error("custom operation {operation:?} failed: {message}")]
    Custom { operation: String, message: String },
}

impl StatefulError {
    /// Whether this error is a "missing" condition rather than a bad request.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StatefulError::ResourceNotFound(_)
                | StatefulError::RecordNotFound { .. }
                | StatefulError::CustomUnavailable(_)
        )
    }
}

/// Errors surfaced by the engine's admin and protocol entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An explicit lookup (admin ID, gRPC method, stateful record) missed.
    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },

    /// Live traffic that no mock handles. Not a system failure.
    #[error("no {protocol} mock matches {target}")]
    NoMatch {
        protocol: MockType,
        target: String,
    },

    #[error(transparent)]
    Stateful(#[from] StatefulError),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn no_match(protocol: MockType, target: impl Into<String>) -> Self {
        EngineError::NoMatch {
            protocol,
            target: target.into(),
        }
    }

    /// True for both admin misses and stateful record misses.
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound { .. } => true,
            EngineError::Stateful(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, EngineError::NoMatch { .. })
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
