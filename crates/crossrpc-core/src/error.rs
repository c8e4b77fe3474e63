//! Error types for crossrpc.
//!
//! Every failure a caller can observe is recoverable at the call site. Failures
//! that cross the wire travel as a plain failure payload (see
//! [`RpcError::to_payload`]) and are rebuilt on the calling side with
//! [`RpcError::from_payload`].

use crate::config::ProtocolConfig;
use crate::envelope::EnvelopeError;
use crate::environment::Environment;
use serde_json::Value;
use thiserror::Error;

/// Main error type for crossrpc.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No handler is registered under the name in the resolved context, or the
    /// browser owning the name is gone.
    #[error("PROCEDURE_NOT_FOUND")]
    ProcedureNotFound,

    /// A public entry point was used with the wrong target shape for the
    /// current context.
    #[error("{message}")]
    InvalidArguments { message: String },

    #[error("{operation} can only be used in the client environment (called from {environment})")]
    WrongEnvironment {
        operation: &'static str,
        environment: Environment,
    },

    /// The remote handler failed; carries its failure payload verbatim.
    #[error("Remote procedure failed: {0}")]
    Remote(Value),

    #[error("Malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The context was dropped while the call was still pending.
    #[error("Context closed before the call settled")]
    Closed,
}

/// Result type alias for crossrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        RpcError::InvalidArguments {
            message: message.into(),
        }
    }

    /// Rebuild an error from a response's failure payload.
    ///
    /// The not-found sentinel maps back to [`RpcError::ProcedureNotFound`] so
    /// callers see the same variant whether the lookup failed locally or in a
    /// remote context.
    pub fn from_payload(payload: Value) -> Self {
        if payload.as_str() == Some(ProtocolConfig::ERR_NOT_FOUND) {
            RpcError::ProcedureNotFound
        } else {
            RpcError::Remote(payload)
        }
    }

    /// Failure payload to put in a response envelope's `err` field.
    pub fn to_payload(&self) -> Value {
        match self {
            RpcError::ProcedureNotFound => Value::String(ProtocolConfig::ERR_NOT_FOUND.to_string()),
            RpcError::Remote(payload) => payload.clone(),
            other => Value::String(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::ProcedureNotFound)
    }
}
