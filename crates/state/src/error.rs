//! Error types for keyed state operations.

use thiserror::Error;

/// Errors surfaced by the keyed state backend and its state handles.
#[derive(Debug, Error)]
pub enum StateError {
    /// Caller-fixable misconfiguration, such as a missing key serializer.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend was wired incorrectly by its owning task.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-supplied function failed during bulk key iteration.
    #[error("user function failed during key iteration: {0}")]
    UserFunction(#[source] anyhow::Error),

    #[error("state '{name}' is registered as {registered} but was requested as {requested}")]
    TypeMismatch {
        name: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("no current key set")]
    NoCurrentKey,

    #[error("no namespace set for state '{0}'")]
    NoNamespace(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("closeable registry is already closed")]
    RegistryClosed,
}

impl From<bincode::Error> for StateError {
    fn from(err: bincode::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StateError>;
