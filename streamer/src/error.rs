//! Streamer error types

use std::path::PathBuf;
use thiserror::Error;

use shared::SharedError;

/// Result type for streamer operations
pub type StreamerResult<T> = Result<T, StreamerError>;

/// Failures while locating, parsing or validating the configuration
///
/// All of these are fatal at startup; the host decides whether to abort the
/// run or continue without streaming.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Config file not found (searched {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("Config parse failure: {0}")]
    ParseFailure(String),

    #[error("Missing required config field: {0}")]
    MissingRequiredField(String),

    #[error("Invalid config field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Streamer error types
///
/// Cloneable so terminal failures can be handed out by the status query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Outbound queue full, event dropped after {timeout_ms}ms")]
    QueueFull { timeout_ms: u64 },

    #[error("Outbound queue closed")]
    QueueClosed,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol version mismatch: client {client}, collector {server}")]
    ProtocolVersionMismatch { client: u32, server: u32 },

    #[error("Handshake rejected by collector: {reason}")]
    HandshakeRejected { reason: String },

    #[error("Run cancelled by collector: {reason}")]
    RunCancelled { reason: String },

    #[error("Collector reported a fatal error: {reason}")]
    CollectorFatal { reason: String },

    #[error("Flush timed out with {undelivered} undelivered events")]
    FlushTimeout { undelivered: u64 },

    #[error("Run has not been started")]
    RunNotStarted,

    #[error("Run already started")]
    RunAlreadyStarted,

    #[error("Run already finished")]
    RunAlreadyFinished,

    #[error("Scope already started: {scope_id}")]
    ScopeAlreadyStarted { scope_id: String },

    #[error("Scope is not open: {scope_id}")]
    ScopeNotOpen { scope_id: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl StreamerError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime { message: message.into() }
    }

    pub fn io(path: impl Into<String>, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }

    /// Errors that end the session for the rest of the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamerError::ProtocolVersionMismatch { .. }
                | StreamerError::HandshakeRejected { .. }
                | StreamerError::RunCancelled { .. }
                | StreamerError::CollectorFatal { .. }
        )
    }

    /// Caller-side misuse of the sink (wrong scope or run ordering)
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StreamerError::RunNotStarted
                | StreamerError::RunAlreadyStarted
                | StreamerError::RunAlreadyFinished
                | StreamerError::ScopeAlreadyStarted { .. }
                | StreamerError::ScopeNotOpen { .. }
        )
    }
}

impl From<SharedError> for StreamerError {
    fn from(error: SharedError) -> Self {
        StreamerError::Codec { message: error.to_string() }
    }
}
