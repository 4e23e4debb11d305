//! Run configuration
//!
//! Resolved once per run from a YAML document; read-only afterwards.

pub mod env;
pub mod resolver;

pub use env::expand_env_tokens;
pub use resolver::{COLLECTOR_PATH, CONFIG_OVERRIDE_VAR, ConfigResolver, DEFAULT_CONFIG_FILE, resolve_document};

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use url::Url;

use shared::{MetadataEntry, RunIdentity};

/// Group the run belongs to
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupConfig {
    pub name: Option<String>,
    pub metadata: Vec<MetadataEntry>,
}

/// Where to write the URLs handed out by the collector
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UrlFiles {
    pub run_url_file: Option<PathBuf>,
    pub group_url_file: Option<PathBuf>,
}

/// Queueing, timeout and retry tuning
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSettings {
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub batch_size: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    /// Relative jitter applied to every backoff delay, in `[0, 1)`
    pub backoff_jitter: f64,
    /// Give up connecting (and go degraded) after this much time without a session
    pub max_reconnect_elapsed: Duration,
    pub flush_timeout: Duration,
    pub close_timeout: Duration,
    /// Flush window used by the Ctrl-C shutdown hook
    pub shutdown_timeout: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            enqueue_timeout: Duration::from_millis(2_000),
            batch_size: 100,
            connect_timeout: Duration::from_millis(5_000),
            handshake_timeout: Duration::from_millis(5_000),
            ack_timeout: Duration::from_millis(5_000),
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2.0,
            backoff_cap: Duration::from_millis(30_000),
            backoff_jitter: 0.2,
            max_reconnect_elapsed: Duration::from_millis(60_000),
            flush_timeout: Duration::from_millis(10_000),
            close_timeout: Duration::from_millis(2_000),
            shutdown_timeout: Duration::from_millis(2_000),
        }
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// URL as configured
    pub server_url: Url,
    /// Websocket endpoint derived from `server_url`
    pub endpoint: Url,
    pub run_name: String,
    pub run_id: Option<String>,
    pub metadata: Vec<MetadataEntry>,
    pub group: Option<GroupConfig>,
    pub url_files: UrlFiles,
    pub streaming: StreamingSettings,
}

impl Config {
    /// Configuration with defaults for everything but the server URL
    pub fn new(server_url: Url) -> Result<Self, crate::error::ConfigError> {
        let endpoint = resolver::websocket_endpoint(&server_url)?;
        Ok(Self {
            server_url,
            endpoint,
            run_name: default_run_name(),
            run_id: None,
            metadata: Vec::new(),
            group: None,
            url_files: UrlFiles::default(),
            streaming: StreamingSettings::default(),
        })
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            run_id: self.run_id.clone(),
            run_name: self.run_name.clone(),
            group_name: self.group.as_ref().and_then(|group| group.name.clone()),
        }
    }

    pub fn group_metadata(&self) -> Vec<MetadataEntry> {
        self.group.as_ref().map(|group| group.metadata.clone()).unwrap_or_default()
    }
}

/// Timestamp-based run name used when none is configured
pub fn default_run_name() -> String {
    Utc::now().format("run-%Y%m%d-%H%M%S").to_string()
}
