//! Error handling for the Evidence Graph
//!
//! Every fallible operation in the crate returns [`EvidenceResult`]. The
//! first five variants are the integrity taxonomy that collaborators grade
//! themselves; the rest are plumbing failures from storage, serialization,
//! configuration and the network.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the Evidence Graph
#[derive(Error, Debug)]
pub enum EvidenceError {
    /// Malformed input, rejected before any hash is computed.
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Chain validation found a mismatch or broken link.
    #[error("Integrity violation on {source_system} at sequence {sequence}: {message}")]
    Integrity {
        source_system: String,
        sequence: u64,
        message: String,
    },

    /// Monotonicity violated in a stream.
    #[error("Sequence gap on {source_system}: missing {from}..={to}")]
    SequenceGap {
        source_system: String,
        from: u64,
        to: u64,
    },

    /// External witness or timestamp authority unreachable.
    #[error("Witness unavailable: {provider} - {message}")]
    WitnessUnavailable { provider: String, message: String },

    /// Attempt to move a clock out of a state that does not allow it.
    #[error("Invalid clock transition for {clock_id}: {from} -> {to}")]
    InvalidTransition {
        clock_id: String,
        from: String,
        to: String,
    },

    #[error("Sequence conflict on {source_system}: expected {expected}, store has {actual}")]
    SequenceConflict {
        source_system: String,
        expected: u64,
        actual: u64,
    },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Database operation failed: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

impl EvidenceError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn integrity(
        source_system: impl Into<String>,
        sequence: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            source_system: source_system.into(),
            sequence,
            message: message.into(),
        }
    }

    pub fn witness_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WitnessUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        clock_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            clock_id: clock_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short machine-readable category, used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Integrity { .. } => "integrity_error",
            Self::SequenceGap { .. } => "sequence_gap_error",
            Self::WitnessUnavailable { .. } => "witness_unavailable_error",
            Self::InvalidTransition { .. } => "invalid_transition_error",
            Self::SequenceConflict { .. } => "sequence_conflict",
            Self::NotFound { .. } => "not_found",
            Self::Database { .. } => "database_error",
            Self::Serialization { .. } => "serialization_error",
            Self::Config { .. } => "config_error",
            Self::Io { .. } => "io_error",
            Self::Network { .. } => "network_error",
            Self::MutexPoisoned { .. } => "lock_poisoned",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for EvidenceError {
    fn into_response(self) -> Response {
        let status = match self {
            EvidenceError::Validation { .. } | EvidenceError::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }
            EvidenceError::NotFound { .. } => StatusCode::NOT_FOUND,
            EvidenceError::InvalidTransition { .. } | EvidenceError::SequenceConflict { .. } => {
                StatusCode::CONFLICT
            }
            EvidenceError::Integrity { .. } | EvidenceError::SequenceGap { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EvidenceError::WitnessUnavailable { .. } | EvidenceError::Network { .. } => {
                StatusCode::BAD_GATEWAY
            }
            EvidenceError::Database { .. }
            | EvidenceError::Config { .. }
            | EvidenceError::Io { .. }
            | EvidenceError::MutexPoisoned { .. }
            | EvidenceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = axum::Json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Poison-safe mutex locking.
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> EvidenceResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> EvidenceResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| EvidenceError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> EvidenceResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> EvidenceResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| EvidenceError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> EvidenceResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> EvidenceResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| EvidenceError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

impl From<sled::Error> for EvidenceError {
    fn from(err: sled::Error) -> Self {
        EvidenceError::database("sled_operation", err)
    }
}

impl From<serde_json::Error> for EvidenceError {
    fn from(err: serde_json::Error) -> Self {
        EvidenceError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for EvidenceError {
    fn from(err: std::io::Error) -> Self {
        EvidenceError::io("io_operation", err)
    }
}

impl From<reqwest::Error> for EvidenceError {
    fn from(err: reqwest::Error) -> Self {
        EvidenceError::Network {
            operation: "http_request".to_string(),
            source: err,
        }
    }
}

impl From<figment::Error> for EvidenceError {
    fn from(err: figment::Error) -> Self {
        EvidenceError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EvidenceError::validation("event_type", "must not be empty");
        assert!(err.to_string().contains("Validation error"));
        assert_eq!(err.kind(), "validation_error");

        let err = EvidenceError::invalid_transition("clk-1", "MET", "RUNNING");
        assert!(err.to_string().contains("MET -> RUNNING"));
    }

    #[test]
    fn test_error_chaining() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err = EvidenceError::io("reading notary key", io_err);

        assert!(err.source().is_some());
        assert!(err.to_string().contains("I/O operation failed"));
    }

    #[test]
    fn test_status_mapping() {
        let resp = EvidenceError::not_found("clock", "missing").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = EvidenceError::invalid_transition("c", "BREACHED", "MET").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
