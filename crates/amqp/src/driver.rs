//! Transport driver abstraction.
//!
//! The connection core does not speak the broker protocol itself. It drives an
//! implementation of these traits, which exposes the handful of primitives the
//! core needs: connect, open a channel, declare an exchange, close a channel,
//! and report close/error notifications through registered callbacks.
//!
//! ```text
//! PubSubManager
//!     ↓
//! ConnectionSupervisor / ChannelCache / ExchangeInitializer
//!     ↓
//! Driver → DriverConnection → DriverChannel
//!     ↓
//! lapin (or any other AMQP client)
//! ```
//!
//! Callbacks are plain synchronous closures. Drivers may invoke them from any
//! thread; the core only touches lock-protected state from inside them.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Called once when a connection has closed.
pub type CloseHandler = Box<dyn FnOnce() + Send + 'static>;

/// Called for every error a connection or channel reports.
pub type ErrorHandler = Box<dyn FnMut(DriverError) + Send + 'static>;

/// Entry point of a transport driver.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: DriverConnection<Channel = Self::Channel>;
    type Channel: DriverChannel;

    /// Opens a new transport session to `url`.
    async fn connect(&self, url: &str) -> Result<Self::Connection, DriverError>;
}

/// A live transport session.
#[async_trait]
pub trait DriverConnection: Send + Sync + 'static {
    type Channel: DriverChannel;

    /// Opens a logical channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<Self::Channel, DriverError>;

    /// Registers the observer for connection closure.
    fn on_close(&self, handler: CloseHandler);

    /// Registers the observer for non-fatal connection errors.
    fn on_error(&self, handler: ErrorHandler);
}

/// A logical sub-session of a connection.
#[async_trait]
pub trait DriverChannel: Send + Sync + 'static {
    /// Declares `declaration` on the broker, succeeding if it already exists
    /// with the same properties.
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), DriverError>;

    /// Registers the observer for channel-level errors.
    fn on_error(&self, handler: ErrorHandler);

    /// Closes the channel.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Kind of exchange the initializer declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exchange the manager ensures exists.
///
/// Only the name is configurable. Kind, durability and auto-delete are fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
}

impl ExchangeDeclaration {
    /// A durable, non-auto-deleting topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }
}
