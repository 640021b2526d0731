//! Idempotent declaration of the manager's topic exchange.
//!
//! The `ExchangeInitializer` makes sure the configured exchange exists on the
//! broker. The declaration runs at most once: concurrent callers join the
//! in-flight attempt, and later callers get its cached outcome.
//!
//! # Failure policy
//!
//! A failed declaration is cached as well. Repeated `create_exchange()` calls
//! keep returning the same error instead of hammering the broker with a
//! declaration it already rejected (typically a `PRECONDITION_FAILED` for an
//! exchange that exists with other properties). Failed declarations are never
//! retried automatically; call `retry_exchange()` once the cause is fixed.

use std::sync::Arc;

use futures_util::future::FutureExt;
use tracing::{error, info, warn, Instrument};

use super::{
    connection::ConnectionSupervisor,
    driver::{Driver, DriverChannel, ExchangeDeclaration},
    error::PubSubError,
    single_flight::SingleFlight,
};

/// Outcome of an exchange declaration.
pub type ExchangeResult = Result<(), PubSubError>;

/// Declares the topic exchange once per manager.
pub struct ExchangeInitializer<D: Driver> {
    supervisor: ConnectionSupervisor<D>,
    declaration: Arc<ExchangeDeclaration>,
    slot: Arc<SingleFlight<ExchangeResult>>,
}

impl<D: Driver> Clone for ExchangeInitializer<D> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            declaration: self.declaration.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<D: Driver> ExchangeInitializer<D> {
    pub fn new(supervisor: ConnectionSupervisor<D>, declaration: ExchangeDeclaration) -> Self {
        Self {
            supervisor,
            declaration: Arc::new(declaration),
            slot: Arc::new(SingleFlight::new()),
        }
    }

    /// Ensures the exchange exists.
    ///
    /// Returns the cached outcome if a declaration is in flight or has
    /// already completed, successfully or not.
    ///
    /// # Errors
    /// - `PubSubError::Exchange`: the broker rejected the declaration
    /// - `PubSubError::Channel`: no channel could be opened for it
    /// - `PubSubError::Shutdown`: the manager was shut down
    pub async fn create_exchange(&self) -> ExchangeResult {
        let (future, _, _) = self.slot.get_or_start(|_| {
            let supervisor = self.supervisor.clone();
            let declaration = self.declaration.clone();
            let span = supervisor.log().clone();
            async move { Self::declare(&supervisor, &declaration).await }
                .instrument(span)
                .boxed()
        });

        future.await
    }

    /// Declares again if the cached outcome is a failure.
    ///
    /// A pending or successful declaration is returned as-is.
    pub async fn retry_exchange(&self) -> ExchangeResult {
        if self.slot.invalidate_if(|outcome| outcome.is_err()) {
            info!(
                parent: self.supervisor.log(),
                exchange = %self.declaration.name(),
                "Retrying failed exchange declaration"
            );
        }
        self.create_exchange().await
    }

    async fn declare(
        supervisor: &ConnectionSupervisor<D>,
        declaration: &ExchangeDeclaration,
    ) -> ExchangeResult {
        let channel = supervisor.new_channel().await?;

        info!(exchange = %declaration.name(), "Try to create exchange {}", declaration.name());
        let outcome = channel
            .assert_exchange(declaration)
            .await
            .map_err(PubSubError::Exchange);
        match &outcome {
            Ok(()) => info!(
                exchange = %declaration.name(),
                "Successfully created exchange {}", declaration.name()
            ),
            Err(e) => error!(
                exchange = %declaration.name(),
                error = %e,
                "Failed to create exchange {}: {}", declaration.name(), e
            ),
        }

        // one-shot channel, not the shared subscribe channel
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close exchange declaration channel: {}", e);
        }
        outcome
    }

    /// Outcome of the declaration if it has completed.
    pub fn outcome(&self) -> Option<ExchangeResult> {
        self.slot.peek()
    }

    pub fn declaration(&self) -> &ExchangeDeclaration {
        &self.declaration
    }
}
