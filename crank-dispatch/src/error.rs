//! Error types for crank-dispatch.

use thiserror::Error;

use crank_core::ConfigError;

/// Failure reported by a single handler call. Caught and logged by the
/// router; never fatal to the daemon.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("JSON error: {err}"))
    }
}

/// All errors that can arise while building or driving a router.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Resolution or registration failed; fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A handler raised an error for one event.
    #[error("{context}: handler failed: {source}")]
    Handler {
        context: String,
        #[source]
        source: HandlerError,
    },
}
