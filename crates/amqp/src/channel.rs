//! Shared subscribe channel derived from the supervised connection.
//!
//! The `ChannelCache` hands every caller the same subscribe channel. It does
//! not retry on its own: when the channel reports an error it is dropped from
//! the cache, and the next `get_subscribe_channel()` derives a new one
//! (from the same connection if it is still alive, otherwise from whatever
//! the supervisor reconnects to).
//!
//! The cache is also cleared when the underlying connection closes, since a
//! channel cannot outlive its connection.

use std::sync::Arc;

use futures_util::future::FutureExt;
use tracing::{debug, error, Instrument};

use super::{
    connection::ConnectionSupervisor,
    driver::{Driver, DriverChannel},
    error::PubSubError,
    single_flight::SingleFlight,
};

/// Outcome of a subscribe channel request.
pub type ChannelResult<C> = Result<Arc<C>, PubSubError>;

/// Caches the single subscribe channel of a manager.
pub struct ChannelCache<D: Driver> {
    supervisor: ConnectionSupervisor<D>,
    slot: Arc<SingleFlight<ChannelResult<D::Channel>>>,
}

impl<D: Driver> Clone for ChannelCache<D> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<D: Driver> ChannelCache<D> {
    /// Creates the cache and hooks it to the supervisor's close notification.
    pub fn new(supervisor: ConnectionSupervisor<D>) -> Self {
        let slot = Arc::new(SingleFlight::new());

        let weak = Arc::downgrade(&slot);
        let log = supervisor.log().clone();
        supervisor.on_close(move || {
            if let Some(slot) = weak.upgrade() {
                if slot.clear() {
                    debug!(parent: &log, "Subscribe channel dropped with its connection");
                }
            }
        });

        Self { supervisor, slot }
    }

    /// Returns the shared subscribe channel, deriving one if none is cached.
    ///
    /// # Errors
    /// - `PubSubError::Channel`: the connection refused to open a channel.
    ///   The failure is not cached; the next call tries again.
    /// - `PubSubError::Shutdown`: the manager was shut down
    pub async fn get_subscribe_channel(&self) -> ChannelResult<D::Channel> {
        let (future, _, _) = self.slot.get_or_start(|generation| {
            let supervisor = self.supervisor.clone();
            let slot = Arc::downgrade(&self.slot);
            let span = supervisor.log().clone();

            async move {
                let result = Self::derive(&supervisor, &slot, generation).await;
                if result.is_err() {
                    if let Some(slot) = slot.upgrade() {
                        slot.invalidate(generation);
                    }
                }
                result
            }
            .instrument(span)
            .boxed()
        });

        future.await
    }

    async fn derive(
        supervisor: &ConnectionSupervisor<D>,
        slot: &std::sync::Weak<SingleFlight<ChannelResult<D::Channel>>>,
        generation: u64,
    ) -> ChannelResult<D::Channel> {
        let channel = supervisor.new_channel().await?;

        let slot = slot.clone();
        let log = supervisor.log().clone();
        channel.on_error(Box::new(move |err| {
            error!(parent: &log, error = %err, "Subscribe channel error: {}", err);
            if let Some(slot) = slot.upgrade() {
                slot.invalidate(generation);
            }
        }));

        debug!("Subscribe channel opened");
        Ok(Arc::new(channel))
    }

    /// Drops the cached channel, if any, without closing it.
    pub fn invalidate(&self) -> bool {
        self.slot.clear()
    }

    /// Returns true when a channel (or a pending derivation) is cached.
    pub fn is_cached(&self) -> bool {
        !self.slot.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tracing::Span;

    use super::*;
    use crate::{backoff::BackoffConfig, testing::MockDriver};

    fn cache(driver: MockDriver) -> ChannelCache<MockDriver> {
        let supervisor = ConnectionSupervisor::new(
            driver,
            "amqp://localhost",
            BackoffConfig::default(),
            Span::none(),
        );
        ChannelCache::new(supervisor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_channel_without_error() {
        let driver = MockDriver::new();
        let mock = driver.state();
        let cache = cache(driver);

        let a = cache.get_subscribe_channel().await.unwrap();
        let b = cache.get_subscribe_channel().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mock.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_open_one_channel() {
        let driver = MockDriver::new();
        let mock = driver.state();
        let cache = cache(driver);

        let calls = (0..8).map(|_| cache.get_subscribe_channel());
        let channels = futures_util::future::join_all(calls).await;
        let first = channels[0].as_ref().unwrap();
        assert!(channels
            .iter()
            .all(|c| Arc::ptr_eq(c.as_ref().unwrap(), first)));
        assert_eq!(mock.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_invalidates_cache() {
        let driver = MockDriver::new();
        let mock = driver.state();
        let cache = cache(driver);

        let first = cache.get_subscribe_channel().await.unwrap();
        mock.channel(0).fail("PRECONDITION_FAILED");
        assert!(!cache.is_cached());

        let second = cache.get_subscribe_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());

        // same live connection, no reconnect
        assert_eq!(mock.connect_calls(), 1);
        assert_eq!(mock.channel(1).connection_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_channel_error_keeps_new_channel() {
        let driver = MockDriver::new();
        let mock = driver.state();
        let cache = cache(driver);

        cache.get_subscribe_channel().await.unwrap();
        mock.channel(0).fail("first");
        let second = cache.get_subscribe_channel().await.unwrap();

        // the old channel reports again after being replaced
        mock.channel(0).fail("late");
        let third = cache.get_subscribe_channel().await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_close_drops_channel() {
        let driver = MockDriver::new();
        let mock = driver.state();
        let cache = cache(driver);

        let first = cache.get_subscribe_channel().await.unwrap();
        mock.connection(0).close();
        assert!(!cache.is_cached());

        let second = cache.get_subscribe_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(mock.connect_calls(), 2);
        assert_eq!(mock.channel(1).connection_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_derivation_is_not_cached() {
        let driver = MockDriver::new();
        let mock = driver.state();
        mock.fail_next_channel("NOT_ALLOWED");
        let cache = cache(driver);

        let err = cache.get_subscribe_channel().await.unwrap_err();
        assert!(matches!(err, PubSubError::Channel(_)));
        assert!(!cache.is_cached());

        assert!(cache.get_subscribe_channel().await.is_ok());
    }
}
