//! Connection state tracking for the supervisor.
//!
//! The supervisor publishes its current state on a `tokio::sync::watch`
//! channel, so observers always see the latest value without polling.
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use bkpubsub_amqp::ConnectionState;
//!
//! let state = ConnectionState::Attempting { attempt: 3, delay: Duration::from_millis(4100) };
//! println!("Status: {}", state);  // "Attempting (trial #3 in 4100 ms)"
//! println!("Type: {}", state.as_str());  // "Attempting"
//! ```

use std::{fmt, time::Duration};

/// Represents the current state of the supervised connection.
///
/// The lifecycle flows through these states:
/// - `Idle` -> `Attempting` (first `get_connection()` call)
/// - `Attempting` -> `Attempting` (connect failed, next trial scheduled)
/// - `Attempting` -> `Connected` (connect succeeded, backoff reset)
/// - `Connected` -> `Closed` (transport reported closure, cache cleared)
/// - `Closed` -> `Attempting` (next `get_connection()` call starts a fresh loop)
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection has been requested yet.
    Idle,

    /// Waiting `delay` before connect trial number `attempt`.
    Attempting { attempt: u32, delay: Duration },

    /// A live connection is cached and shared by all callers.
    Connected,

    /// The last connection closed. Nothing is cached until the next request.
    Closed,
}

impl ConnectionState {
    /// Returns a short string identifier for the current state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Attempting { .. } => "Attempting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Closed => "Closed",
        }
    }

    /// Returns contextual details about the current state.
    ///
    /// Only `Attempting` carries details: the trial number and its delay.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Attempting { attempt, delay } => {
                format!("trial #{attempt} in {} ms", delay.as_millis())
            }
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Attempting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Idle.as_str(), "Idle");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(ConnectionState::Closed.as_str(), "Closed");
        assert_eq!(
            ConnectionState::Attempting {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
            .as_str(),
            "Attempting"
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Attempting {
                attempt: 2,
                delay: Duration::from_millis(2150)
            }
            .to_string(),
            "Attempting (trial #2 in 2150 ms)"
        );
    }

    #[test]
    fn test_is_connected_and_connecting() {
        let attempting = ConnectionState::Attempting {
            attempt: 1,
            delay: Duration::ZERO,
        };
        assert!(ConnectionState::Connected.is_connected());
        assert!(!attempting.is_connected());
        assert!(attempting.is_connecting());
        assert!(!ConnectionState::Closed.is_connecting());
        assert!(!ConnectionState::Idle.is_connecting());
    }
}
