//! Error handling for the connection manager.
//!
//! This module defines `PubSubError`, the unified error type returned by the
//! supervisor, the channel cache and the exchange initializer, and
//! `DriverError`, the error type transport drivers report back.
//!
//! # Error Categories
//!
//! **Construction errors** (raised synchronously by the builder):
//! - `MissingLog`: no logging span was supplied
//! - `MissingExchangeName`: no exchange name was supplied
//! - `Config`: validation failures in the connection settings
//! - `NoRuntime`: auto-create requested outside a tokio runtime
//!
//! **Runtime errors**:
//! - `Channel`: the driver failed to open a channel on a live connection
//! - `Exchange`: the exchange declaration was rejected
//! - `Shutdown`: the manager was shut down while a caller was waiting
//!
//! Transient connect failures have no variant. The supervisor
//! retries them forever and they only ever show up in logs.
//!
//! Both types are `Clone`: results travel through shared futures and every
//! caller that joined an in-flight operation receives its own copy.

use thiserror::Error;

/// The unified error type for connection manager operations.
#[derive(Debug, Clone, Error)]
pub enum PubSubError {
    /// The builder was finished without a logging span.
    #[error("Configuration error: need to define log")]
    MissingLog,

    /// The builder was finished without an exchange name.
    #[error("Configuration error: need to define exchange_name")]
    MissingExchangeName,

    /// Connection settings failed validation.
    ///
    /// See `Config` for the rules (url scheme, delay bounds, jitter range).
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// Automatic exchange creation needs a running tokio runtime.
    #[error("Configuration error: auto_create_exchange requires a running tokio runtime")]
    NoRuntime,

    /// Opening a channel on the supervised connection failed.
    ///
    /// Recovery: call again. Failed derivations are never cached.
    #[error("Channel error: {0}")]
    Channel(DriverError),

    /// Declaring the topic exchange failed.
    ///
    /// The failure stays cached; use `retry_exchange()` to declare again.
    #[error("Exchange error: {0}")]
    Exchange(DriverError),

    /// The manager was shut down before the operation could complete.
    #[error("Connection manager is shut down")]
    Shutdown,
}

impl PubSubError {
    /// Returns true for errors raised while building the manager.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PubSubError::MissingLog
                | PubSubError::MissingExchangeName
                | PubSubError::Config(_)
                | PubSubError::NoRuntime
        )
    }
}

/// Error reported by a transport driver.
///
/// Drivers wrap their native errors into this type so that failures can be
/// cloned into every waiter of a shared future and forwarded over the
/// lifecycle broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(feature = "lapin")]
impl From<lapin::Error> for DriverError {
    fn from(err: lapin::Error) -> Self {
        DriverError::new(err.to_string())
    }
}
