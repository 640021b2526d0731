//! Scripted in-memory driver for unit tests.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    driver::{
        CloseHandler, Driver, DriverChannel, DriverConnection, ErrorHandler, ExchangeDeclaration,
    },
    error::DriverError,
};

/// State shared by the driver and everything it hands out.
#[derive(Default)]
pub(crate) struct MockState {
    connect_calls: AtomicUsize,
    connect_failures: AtomicUsize,
    close_on_register: AtomicBool,
    channel_failures: Mutex<VecDeque<DriverError>>,
    exchange_outcomes: Mutex<VecDeque<Result<(), DriverError>>>,
    assert_exchange_calls: AtomicUsize,
    connections: Mutex<Vec<Arc<ConnectionHandle>>>,
    channels: Mutex<Vec<Arc<ChannelHandle>>>,
    declarations: Mutex<Vec<ExchangeDeclaration>>,
}

impl MockState {
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Makes new connections report closure as soon as a close observer is
    /// registered, like a lapin connection that failed right after connecting.
    pub fn close_on_register(&self, enabled: bool) {
        self.close_on_register.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_next_channel(&self, message: &str) {
        self.channel_failures
            .lock()
            .unwrap()
            .push_back(DriverError::new(message));
    }

    pub fn script_exchange(&self, outcome: Result<(), DriverError>) {
        self.exchange_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn assert_exchange_calls(&self) -> usize {
        self.assert_exchange_calls.load(Ordering::SeqCst)
    }

    pub fn declarations(&self) -> Vec<ExchangeDeclaration> {
        self.declarations.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<ConnectionHandle> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn channel(&self, index: usize) -> Arc<ChannelHandle> {
        self.channels.lock().unwrap()[index].clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    fn take_connect_failure(&self) -> bool {
        self.connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;
    type Channel = MockChannel;

    async fn connect(&self, _url: &str) -> Result<MockConnection, DriverError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if self.state.take_connect_failure() {
            return Err(DriverError::new("ECONNREFUSED"));
        }

        let mut connections = self.state.connections.lock().unwrap();
        let handle = Arc::new(ConnectionHandle {
            id: connections.len(),
            close: Mutex::new(None),
            error: Mutex::new(None),
        });
        connections.push(handle.clone());
        Ok(MockConnection {
            handle,
            state: self.state.clone(),
        })
    }
}

/// Test-side handle to a connection the driver opened.
pub(crate) struct ConnectionHandle {
    id: usize,
    close: Mutex<Option<CloseHandler>>,
    error: Mutex<Option<ErrorHandler>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Simulates the transport reporting closure.
    pub fn close(&self) {
        let handler = self.close.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Simulates a non-fatal connection error.
    pub fn fail(&self, message: &str) {
        if let Some(handler) = self.error.lock().unwrap().as_mut() {
            handler(DriverError::new(message));
        }
    }
}

pub(crate) struct MockConnection {
    handle: Arc<ConnectionHandle>,
    state: Arc<MockState>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.handle.id)
            .finish()
    }
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.handle.id
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    type Channel = MockChannel;

    async fn create_channel(&self) -> Result<MockChannel, DriverError> {
        tokio::task::yield_now().await;

        if let Some(err) = self.state.channel_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut channels = self.state.channels.lock().unwrap();
        let handle = Arc::new(ChannelHandle {
            id: channels.len(),
            connection_id: self.handle.id,
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        channels.push(handle.clone());
        Ok(MockChannel {
            handle,
            state: self.state.clone(),
        })
    }

    fn on_close(&self, handler: CloseHandler) {
        if self.state.close_on_register.load(Ordering::SeqCst) {
            handler();
            return;
        }
        *self.handle.close.lock().unwrap() = Some(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        *self.handle.error.lock().unwrap() = Some(handler);
    }
}

/// Test-side handle to a channel the driver opened.
pub(crate) struct ChannelHandle {
    id: usize,
    connection_id: usize,
    error: Mutex<Option<ErrorHandler>>,
    closed: AtomicBool,
}

impl ChannelHandle {
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates a channel-level error.
    pub fn fail(&self, message: &str) {
        if let Some(handler) = self.error.lock().unwrap().as_mut() {
            handler(DriverError::new(message));
        }
    }
}

pub(crate) struct MockChannel {
    handle: Arc<ChannelHandle>,
    state: Arc<MockState>,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("id", &self.handle.id)
            .field("connection_id", &self.handle.connection_id)
            .finish()
    }
}

impl MockChannel {
    pub fn id(&self) -> usize {
        self.handle.id
    }
}

#[async_trait]
impl DriverChannel for MockChannel {
    async fn assert_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), DriverError> {
        self.state
            .assert_exchange_calls
            .fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        self.state
            .declarations
            .lock()
            .unwrap()
            .push(declaration.clone());
        self.state
            .exchange_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn on_error(&self, handler: ErrorHandler) {
        *self.handle.error.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
