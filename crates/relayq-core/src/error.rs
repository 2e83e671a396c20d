//! Unified error type for the relayq queue engine.
//!
//! Mirrors the layered-error-enum convention used across this codebase: one
//! `thiserror`-derived enum per crate boundary, with `anyhow::Error` as an
//! escape hatch for injected collaborators (transaction factories, custom
//! serializers) that the engine does not own.

use std::fmt;

use uuid::Uuid;

/// Errors surfaced by the relayq engine's public API and internal loops.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A database operation failed. The source is preserved for logging but
    /// never inspected by callers; store failures are opaque.
    #[error("database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A lookup by id found nothing.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// A caller passed something the public API rejects synchronously; it
    /// never reaches the store.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Configuration failed to load or validate.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A handler returned or threw an error while processing a message.
    #[error("handler failed for message {message_id}: {message}")]
    HandlerFailed { message_id: Uuid, message: String },

    /// The engine is mid-shutdown and cannot accept the requested operation.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for injected collaborators (transaction factories, custom
    /// serializers) outside the engine's own error taxonomy.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

impl Error {
    pub fn database(message: impl Into<String>) -> Self {
        Error::Database {
            message: message.into(),
            source: None,
        }
    }

    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Error::NotFound { entity, id }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn handler_failed(message_id: Uuid, message: impl fmt::Display) -> Self {
        Error::HandlerFailed {
            message_id,
            message: message.to_string(),
        }
    }

    /// True for errors the consumer loop should treat as transient (i.e.
    /// safe to retry at the next poll without changing message state).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_is_transient() {
        let err = Error::database("connection reset");
        assert!(err.is_transient());
    }

    #[test]
    fn not_found_formats_entity_and_id() {
        let id = Uuid::nil();
        let err = Error::not_found("message", id);
        assert_eq!(err.to_string(), format!("message {id} not found"));
    }

    #[test]
    fn invalid_input_is_not_transient() {
        let err = Error::invalid_input("queue name must not be empty");
        assert!(!err.is_transient());
    }
}
