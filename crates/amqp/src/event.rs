//! Lifecycle notifications broadcast by the supervisor.
//!
//! Unlike the state watch channel, which only keeps the latest value, the
//! broadcast channel delivers every event to every subscriber. Dependent
//! components use `Close` to drop anything derived from the old connection.

use std::time::Duration;

use crate::error::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A connect trial was scheduled after `delay`.
    Attempt { attempt: u32, delay: Duration },

    /// Trial number `attempt` produced a live connection.
    Connected { attempt: u32 },

    /// The active connection closed and the cached connection was dropped.
    Close,

    /// The active connection reported an error but remains cached.
    Error(DriverError),
}

impl LifecycleEvent {
    pub fn is_close(&self) -> bool {
        matches!(self, LifecycleEvent::Close)
    }
}
