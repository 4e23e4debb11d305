//! Shared logging utilities for consistent tracing across the streamer and its hosts

use chrono::{DateTime, Utc};
use tracing::{error, info};

/// Build the default filter directive for a base level
pub fn filter_directive(log_level: Option<&str>) -> String {
    let base_level = log_level.unwrap_or("info");
    format!("streamer={base_level},shared={base_level},tokio_tungstenite=warn,tungstenite=warn")
}

/// Initialize a stdout tracing subscriber
///
/// `RUST_LOG` wins over `log_level` when set. Uses `try_init` because the host
/// test process may already own the global subscriber; returns whether this
/// call installed one.
pub fn init_tracing(log_level: Option<&str>) -> bool {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .is_ok()
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}

/// Macro for run-aware info logging
#[macro_export]
macro_rules! run_info {
    ($run:expr, $($arg:tt)*) => {
        tracing::info!(
            run = %$run,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for run-aware warning logging
#[macro_export]
macro_rules! run_warn {
    ($run:expr, $($arg:tt)*) => {
        tracing::warn!(
            run = %$run,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for run-aware error logging
#[macro_export]
macro_rules! run_error {
    ($run:expr, $($arg:tt)*) => {
        tracing::error!(
            run = %$run,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for run-aware debug logging
#[macro_export]
macro_rules! run_debug {
    ($run:expr, $($arg:tt)*) => {
        tracing::debug!(
            run = %$run,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Contextual logging helper for run start
pub fn log_startup(run: &str, details: &str) {
    info!(run = %run, timestamp = format_timestamp(), "🚀 Starting {}", details);
}

/// Contextual logging helper for shutdown
pub fn log_shutdown(run: &str, reason: &str) {
    info!(run = %run, timestamp = format_timestamp(), "🛑 Shutting down: {}", reason);
}

/// Contextual logging helper for error conditions
pub fn log_error(run: &str, context: &str, error: &dyn std::fmt::Display) {
    error!(
        run = %run,
        timestamp = format_timestamp(),
        error = %error,
        "❌ {} failed: {}",
        context,
        error
    );
}
