//! Connection supervision with unbounded reconnection and single-flight sharing.
//!
//! The `ConnectionSupervisor` owns the single logical connection of a manager.
//! It is the "heart" of the crate: it runs the retry loop, applies the
//! jittered exponential backoff between trials, caches the in-flight or
//! established connection as one shared future, and notifies subscribers of
//! lifecycle transitions.
//!
//! # Architecture
//!
//! ```text
//! Callers (channel cache, exchange initializer, application)
//!     ↓ get_connection()
//! ConnectionSupervisor (single-flight slot, retry loop, observers)
//!     ↓ connect(url)
//! Driver (lapin or any DriverConnection implementation)
//!     ↓
//! Network (TCP/TLS)
//! ```
//!
//! # Lifecycle
//!
//! - The first `get_connection()` stores a new shared future in the slot and
//!   spawns it, so the loop makes progress even if every caller goes away.
//! - The loop never gives up. Connect failures are logged and retried after
//!   the next backoff delay; the future only resolves with a live connection
//!   (or with `PubSubError::Shutdown` once the manager is torn down).
//! - When the connection closes, the slot is cleared and `Close` is broadcast.
//!   The next `get_connection()` starts a fresh loop.
//! - Connection errors that are not closures are broadcast as `Error`; the
//!   connection stays cached.
//!
//! # Usage
//!
//! ```ignore
//! let supervisor = ConnectionSupervisor::new(driver, url, BackoffConfig::default(), span);
//! let mut events = supervisor.subscribe_events();
//!
//! let connection = supervisor.get_connection().await?;
//! let channel = connection.create_channel().await?;
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::{
    backoff::{Backoff, BackoffConfig, BackoffNotice},
    driver::{Driver, DriverConnection},
    error::PubSubError,
    event::LifecycleEvent,
    single_flight::SingleFlight,
    state::ConnectionState,
};

/// Capacity of the lifecycle broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Outcome of a connection request.
pub type ConnectionResult<C> = Result<Arc<C>, PubSubError>;

type CloseHook = Box<dyn Fn() + Send + Sync + 'static>;

/// Owns the single logical connection of a manager instance.
///
/// Cheap to clone; clones share the same connection, slot and channels.
pub struct ConnectionSupervisor<D: Driver> {
    inner: Arc<SupervisorInner<D>>,
}

struct SupervisorInner<D: Driver> {
    /// Transport driver used for every connect trial
    driver: D,

    /// Broker address
    url: String,

    /// Span every log line of this manager is emitted in
    log: Span,

    /// Backoff schedule, reset once per successful connection
    backoff: tokio::sync::Mutex<Backoff>,

    /// The PendingConnection: in-flight or established connection future
    pending: SingleFlight<ConnectionResult<D::Connection>>,

    /// Internal observers run synchronously when the connection closes
    close_hooks: Mutex<Vec<CloseHook>>,

    /// Lifecycle notifications for external subscribers
    events: broadcast::Sender<LifecycleEvent>,

    /// Latest connection state
    state_tx: watch::Sender<ConnectionState>,

    /// Stops retry loops at shutdown
    cancel: CancellationToken,
}

impl<D: Driver> Clone for ConnectionSupervisor<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> ConnectionSupervisor<D> {
    /// Creates a supervisor. No connection is attempted until the first
    /// `get_connection()` call.
    pub fn new(driver: D, url: impl Into<String>, backoff: BackoffConfig, log: Span) -> Self {
        Self::with_cancel_token(driver, url, backoff, log, CancellationToken::new())
    }

    /// Creates a supervisor whose retry loops stop when `cancel` fires.
    pub fn with_cancel_token(
        driver: D,
        url: impl Into<String>,
        backoff: BackoffConfig,
        log: Span,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(SupervisorInner {
                driver,
                url: url.into(),
                log,
                backoff: tokio::sync::Mutex::new(Backoff::new(backoff)),
                pending: SingleFlight::new(),
                close_hooks: Mutex::new(Vec::new()),
                events,
                state_tx,
                cancel,
            }),
        }
    }

    /// Returns the shared connection, starting a retry loop if none is cached.
    ///
    /// Every caller that arrives while a loop is running joins the same
    /// future and receives the same `Arc`. Connect failures are retried
    /// internally and never returned here.
    ///
    /// # Errors
    /// - `PubSubError::Shutdown`: the supervisor was shut down
    pub async fn get_connection(&self) -> ConnectionResult<D::Connection> {
        if self.inner.cancel.is_cancelled() {
            return Err(PubSubError::Shutdown);
        }

        let (future, _, created) = self.inner.pending.get_or_start(|generation| {
            info!(parent: &self.inner.log, url = %self.inner.url, "Get connection");
            SupervisorInner::retry_loop(self.inner.clone(), generation)
        });

        if created {
            tokio::spawn(future.clone());
        }

        future.await
    }

    /// Opens a one-shot channel on the shared connection.
    ///
    /// The channel is not cached; the caller owns it.
    pub async fn new_channel(&self) -> Result<D::Channel, PubSubError> {
        let connection = self.get_connection().await?;
        connection
            .create_channel()
            .await
            .map_err(PubSubError::Channel)
    }

    /// Subscribes to lifecycle notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribes to connection state changes.
    ///
    /// The receiver sees the current state immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Registers an internal observer run synchronously on connection close,
    /// after the cached connection has been dropped.
    pub(crate) fn on_close(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Stops any running retry loop; subsequent requests fail with `Shutdown`.
    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(parent: &self.inner.log, "Connection supervisor shutting down");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn log(&self) -> &Span {
        &self.inner.log
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }
}

impl<D: Driver> SupervisorInner<D> {
    /// Builds the retry loop future for slot entry `generation`.
    ///
    /// The loop runs until a connect trial succeeds or the supervisor is
    /// cancelled. It never resolves with a connect failure.
    fn retry_loop(
        inner: Arc<Self>,
        generation: u64,
    ) -> BoxFuture<'static, ConnectionResult<D::Connection>> {
        let span = inner.log.clone();
        async move {
            loop {
                let notice = inner.backoff.lock().await.next_delay();
                inner.announce_attempt(notice);

                tokio::select! {
                    _ = inner.cancel.cancelled() => return Err(inner.abandon(notice)),
                    _ = tokio::time::sleep(notice.delay) => {}
                }

                info!(attempt = notice.attempt, "Connection trial #{}; connecting...", notice.attempt);
                let result = tokio::select! {
                    _ = inner.cancel.cancelled() => return Err(inner.abandon(notice)),
                    result = inner.driver.connect(&inner.url) => result,
                };

                match result {
                    Ok(connection) => {
                        inner.backoff.lock().await.reset();
                        let connection = Arc::new(connection);

                        info!(
                            attempt = notice.attempt,
                            "Connection trial #{}; connected to {}", notice.attempt, inner.url
                        );
                        inner.update_state(ConnectionState::Connected);
                        inner.emit(LifecycleEvent::Connected {
                            attempt: notice.attempt,
                        });

                        // observers last: a close reported during registration
                        // must be the final transition
                        Self::watch_connection(&inner, connection.as_ref(), generation);
                        return Ok(connection);
                    }
                    Err(e) => {
                        error!(
                            attempt = notice.attempt,
                            error = %e,
                            "Connection trial #{}; failed: {}", notice.attempt, e
                        );
                    }
                }
            }
        }
        .instrument(span)
        .boxed()
    }

    fn announce_attempt(&self, notice: BackoffNotice) {
        let delay_ms = notice.delay.as_millis() as u64;
        info!(
            attempt = notice.attempt,
            delay_ms,
            "Connection trial #{} : waiting for {} ms...", notice.attempt, delay_ms
        );
        if let Some(count) = notice.escalation() {
            warn!(attempt = notice.attempt, "WARNING: {count} CONNECTION RETRIES");
        }

        self.update_state(ConnectionState::Attempting {
            attempt: notice.attempt,
            delay: notice.delay,
        });
        self.emit(LifecycleEvent::Attempt {
            attempt: notice.attempt,
            delay: notice.delay,
        });
    }

    fn abandon(&self, notice: BackoffNotice) -> PubSubError {
        info!(
            attempt = notice.attempt,
            "Shutdown requested, abandoning connection trial #{}", notice.attempt
        );
        PubSubError::Shutdown
    }

    /// Registers close/error observers on a freshly opened connection.
    ///
    /// Observers hold a weak reference so a dropped supervisor is never kept
    /// alive by the driver.
    fn watch_connection(inner: &Arc<Self>, connection: &D::Connection, generation: u64) {
        let weak = Arc::downgrade(inner);
        connection.on_close(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(generation);
            }
        }));

        let weak = Arc::downgrade(inner);
        connection.on_error(Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                error!(parent: &inner.log, error = %err, "Connection error: {}", err);
                inner.emit(LifecycleEvent::Error(err));
            }
        }));
    }

    fn handle_close(&self, generation: u64) {
        if !self.pending.invalidate(generation) {
            debug!(
                parent: &self.log,
                generation, "Ignoring close of a superseded connection"
            );
            return;
        }

        for hook in self
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            hook();
        }

        info!(parent: &self.log, "Connection closed");
        self.update_state(ConnectionState::Closed);
        self.emit(LifecycleEvent::Close);
    }

    /// Updates the connection state, notifying watchers only on change.
    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });

        if changed {
            debug!(parent: &self.log, "Connection state changed to: {}", state);
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }
}
