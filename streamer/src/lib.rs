//! Run event streaming client
//!
//! Streams test-run lifecycle events (run, suites, cases, logs, attachments)
//! from a host test framework to a remote collector over one resilient
//! websocket session per run. Hosts drive a [`StreamingClient`] through the
//! [`EventSink`] trait; delivery is at-least-once, ordered by sequence number,
//! and a collector outage never blocks the run beyond bounded windows.

pub mod config;
pub mod core;
pub mod error;
pub mod types;
pub mod traits;
pub mod state;
pub mod streamer_impl;
pub mod services;

// Re-export main types
pub use config::{Config, ConfigResolver, StreamingSettings};
pub use error::{ConfigError, StreamerError, StreamerResult};
pub use types::*;
pub use traits::*;
pub use streamer_impl::StreamingClient;
pub use services::*;
