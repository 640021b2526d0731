//! Jittered exponential backoff for connection retry logic.
//!
//! When a connect attempt fails, rather than immediately retrying (which can
//! overwhelm a recovering broker), the supervisor waits an increasing amount
//! of time between attempts.
//!
//! # Algorithm
//!
//! The base delay for attempt `n` (1-based) grows exponentially and is capped:
//! ```text
//! base[n]  = min(initial * multiplier^(n-1), max_delay)
//! delay[n] = base[n] * uniform(1 - factor, 1 + factor)
//! ```
//!
//! With the default settings (initial=1s, multiplier=2, max=8s, factor=0.2):
//! - Attempt 1: wait 0.8s ..= 1.2s
//! - Attempt 2: wait 1.6s ..= 2.4s
//! - Attempt 3: wait 3.2s ..= 4.8s
//! - Attempt 4+: wait 6.4s ..= 9.6s (capped base)
//!
//! There is no attempt limit. The schedule keeps producing delays until the
//! caller stops asking, and `reset()` restarts it at the initial delay.
//!
//! # Examples
//!
//! ```ignore
//! use bkpubsub_amqp::Backoff;
//!
//! let mut backoff = Backoff::default();
//!
//! let notice = backoff.next_delay();
//! assert_eq!(notice.attempt, 1);
//! tokio::time::sleep(notice.delay).await;
//!
//! // Connection succeeded
//! backoff.reset();
//! assert_eq!(backoff.next_delay().attempt, 1);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Attempt numbers at which the supervisor escalates its log level.
pub const ESCALATION_ATTEMPTS: [u32; 2] = [10, 100];

/// Timing parameters for the backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_delay_bounds"))]
pub struct BackoffConfig {
    /// Delay before the first attempt, in milliseconds.
    #[validate(range(min = 1, message = "Initial delay must be at least 1 ms"))]
    pub initial_delay_ms: u64,

    /// Cap applied to the base delay, in milliseconds.
    #[validate(range(min = 1, message = "Max delay must be at least 1 ms"))]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive attempts.
    #[validate(range(min = 1.0, max = 16.0, message = "Multiplier must be between 1 and 16"))]
    pub multiplier: f64,

    /// Relative jitter applied around the base delay.
    #[validate(range(
        min = 0.0,
        max = 0.99,
        message = "Randomisation factor must be between 0 and 0.99"
    ))]
    pub randomisation_factor: f64,
}

fn validate_delay_bounds(config: &BackoffConfig) -> Result<(), ValidationError> {
    if config.max_delay_ms < config.initial_delay_ms {
        let mut err = ValidationError::new("invalid_delay_bounds");
        err.message = Some("Max delay must not be lower than initial delay".into());
        return Err(err);
    }
    Ok(())
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            randomisation_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// One scheduled attempt: its 1-based number and how long to wait before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffNotice {
    pub attempt: u32,
    pub delay: Duration,
}

impl BackoffNotice {
    /// Returns the attempt number if this attempt warrants a warning.
    pub fn escalation(&self) -> Option<u32> {
        ESCALATION_ATTEMPTS
            .iter()
            .copied()
            .find(|&n| n == self.attempt)
    }
}

/// Exponential backoff controller for connection retry logic.
///
/// Each call to `next_delay()` advances the attempt counter and returns the
/// jittered delay for that attempt. The supervisor resets the schedule once
/// per successful connection.
///
/// # Thread Safety
/// Not synchronised; the supervisor keeps it behind a `tokio::sync::Mutex`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,

    /// Count of scheduled attempts (0 before the first one).
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Restores the schedule to its initial state.
    ///
    /// Call this when a connection succeeds, so the next failure starts with
    /// the initial delay again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Schedules the next attempt and returns its number and jittered delay.
    pub fn next_delay(&mut self) -> BackoffNotice {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.base_delay(self.attempt);
        BackoffNotice {
            attempt: self.attempt,
            delay: self.jitter(base),
        }
    }

    /// The un-jittered delay for a given 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        // powi saturates to inf for large exponents, min() folds that back to max
        let millis = (initial * self.config.multiplier.powi(exponent)).min(max);
        Duration::from_secs_f64(millis / 1_000.0)
    }

    fn jitter(&self, base: Duration) -> Duration {
        let factor = self.config.randomisation_factor;
        if factor <= 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        Duration::from_secs_f64((base.as_secs_f64() * scale).max(0.0))
    }

    /// Gets the current attempt count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for Backoff {
    /// 1s initial delay, doubling, capped at 8s, ±20% jitter.
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
