//! Error types for the Gatekeeper subsystem.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the shared store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("store connection error: {0}")]
    Connection(String),

    /// A server-side script failed or returned an unexpected reply
    #[error("script error: {0}")]
    Script(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A shared-store call exceeded its request timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
