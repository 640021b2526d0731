//! bkpubsub: daemon around the `bkpubsub-amqp` connection manager
//!
//! The library half of the `bkpubsub` binary. It holds what the daemon needs
//! besides the connection core itself:
//!
//! * `config`: TOML configuration with a `[logger]` table and a
//!   `[connection]` table (`bkpubsub_amqp::Config`), validated with
//!   `validator`.
//!
//! * `logger`: `tracing` subscriber setup: console output in compact,
//!   pretty or JSON format and optional systemd journald output.
//!
//! ## Features
//!
//! * `journald`: enables the journald log layer (default: enabled).

pub mod config;
pub mod logger;
