//! `Driver` implementation backed by `lapin`.
//!
//! lapin has no separate close notification: every connection-level error is
//! terminal and the connection is unusable afterwards. `LapinConnection`
//! therefore reports such an error to the error observer and then fires the
//! close observer, so the supervisor drops the cached connection and the next
//! request reconnects.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;
use lapin::{
    options::ExchangeDeclareOptions, types::FieldTable, Channel, Connection,
    ConnectionProperties,
};

use crate::{
    driver::{
        CloseHandler, Driver, DriverChannel, DriverConnection, ErrorHandler, ExchangeDeclaration,
        ExchangeKind,
    },
    error::DriverError,
};

/// Reply code sent when closing a channel normally.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections with fixed connection properties.
#[derive(Clone, Default)]
pub struct LapinDriver {
    properties: ConnectionProperties,
}

impl LapinDriver {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Driver for LapinDriver {
    type Connection = LapinConnection;
    type Channel = LapinChannel;

    async fn connect(&self, url: &str) -> Result<LapinConnection, DriverError> {
        let connection = Connection::connect(url, self.properties.clone()).await?;
        Ok(LapinConnection::new(connection))
    }
}

/// Close/error observers of one connection.
///
/// `failed` is set before the close observer is taken, so a close observer
/// registered after the connection already failed fires immediately. The
/// close observer fires at most once.
#[derive(Default)]
struct ConnectionObservers {
    close: Mutex<Option<CloseHandler>>,
    error: Mutex<Option<ErrorHandler>>,
    failed: AtomicBool,
}

impl ConnectionObservers {
    fn set_close(&self, handler: CloseHandler) {
        let mut slot = self.close.lock().unwrap_or_else(PoisonError::into_inner);
        if self.failed.load(Ordering::SeqCst) {
            drop(slot);
            handler();
            return;
        }
        *slot = Some(handler);
    }

    fn set_error(&self, handler: ErrorHandler) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Reports a terminal connection error: error observer first, then close.
    fn fail(&self, err: DriverError) {
        if let Some(handler) = self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            handler(err);
        }

        self.failed.store(true, Ordering::SeqCst);
        let close = self
            .close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = close {
            handler();
        }
    }
}

pub struct LapinConnection {
    connection: Connection,
    observers: Arc<ConnectionObservers>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let observers = Arc::new(ConnectionObservers::default());

        let shared = observers.clone();
        connection.on_error(move |err| shared.fail(DriverError::from(err)));

        Self {
            connection,
            observers,
        }
    }

    /// The underlying lapin connection.
    pub fn inner(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl DriverConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn create_channel(&self) -> Result<LapinChannel, DriverError> {
        let channel = self.connection.create_channel().await?;
        Ok(LapinChannel { channel })
    }

    fn on_close(&self, handler: CloseHandler) {
        self.observers.set_close(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.observers.set_error(handler);
    }
}

pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    /// The underlying lapin channel, for publishing and consuming.
    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl DriverChannel for LapinChannel {
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), DriverError> {
        let kind = match declaration.kind() {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: declaration.durable(),
            auto_delete: declaration.auto_delete(),
            ..Default::default()
        };

        self.channel
            .exchange_declare(declaration.name(), kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    fn on_error(&self, mut handler: ErrorHandler) {
        self.channel
            .on_error(move |err| handler(DriverError::from(err)));
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.channel.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}
