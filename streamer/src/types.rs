//! Streamer-specific data types

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::StreamerError;

/// Why the session is draining
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DrainReason {
    /// `stop()` was called and the queue is being flushed
    Shutdown,
    /// The collector cancelled the run
    Cancelled(String),
    /// A fatal control message or handshake failure ended the session
    Fatal(String),
}

/// Lifecycle of the link to the collector
///
/// Owned by the connection manager; everyone else only observes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Draining(DrainReason),
    Reconnecting,
    /// Connect/handshake retries exhausted; events are logged locally, never sent
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// A session is up, or being set up, with the collector
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Handshaking | ConnectionState::Streaming | ConnectionState::Draining(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Streaming => write!(f, "streaming"),
            ConnectionState::Draining(reason) => write!(f, "draining ({reason:?})"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// What `stop()` managed to deliver
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize)]
pub struct StopReport {
    /// Events acknowledged by the collector over the whole run
    pub delivered: u64,
    /// Events that never reached the collector
    pub dropped: u64,
    /// The flush window elapsed before everything was acknowledged
    pub flush_timed_out: bool,
    /// The collector confirmed the close after `complete`
    pub close_confirmed: bool,
    pub elapsed: Duration,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && !self.flush_timed_out
    }
}

/// Post-run status snapshot exposed by the streaming client
#[derive(Clone, Debug, PartialEq)]
pub struct StreamStatus {
    pub state: ConnectionState,
    /// Authoritative run id (collector-assigned once the handshake succeeded)
    pub run_id: Option<String>,
    pub run_url: Option<String>,
    pub group_url: Option<String>,
    /// The session-ending failure, if any
    pub terminal_error: Option<StreamerError>,
    /// Events dropped on enqueue because the queue stayed full
    pub queue_full_drops: u64,
    /// Events refused because streaming was already shut down
    pub refused_events: u64,
    /// Caller contract violations seen by the sink
    pub contract_violations: u64,
    pub acknowledged_events: u64,
    pub reconnects: u32,
    pub warnings: Vec<String>,
    pub stop_report: Option<StopReport>,
    pub url_files_written: Vec<std::path::PathBuf>,
}

impl StreamStatus {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            run_id: None,
            run_url: None,
            group_url: None,
            terminal_error: None,
            queue_full_drops: 0,
            refused_events: 0,
            contract_violations: 0,
            acknowledged_events: 0,
            reconnects: 0,
            warnings: Vec::new(),
            stop_report: None,
            url_files_written: Vec::new(),
        }
    }
}

/// Kind of an open scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Suite,
    Case,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::Suite => write!(f, "suite"),
            ScopeKind::Case => write!(f, "case"),
        }
    }
}

/// Final outcome of a case as reported by the host framework
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaseOutcome {
    pub status: shared::TestStatus,
    pub duration: Duration,
    pub failure_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl CaseOutcome {
    pub fn passed(duration: Duration) -> Self {
        Self {
            status: shared::TestStatus::Passed,
            duration,
            failure_message: None,
            stack_trace: None,
        }
    }

    pub fn failed(duration: Duration, message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self {
            status: shared::TestStatus::Failed,
            duration,
            failure_message: Some(message.into()),
            stack_trace,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: shared::TestStatus::Skipped,
            duration: Duration::ZERO,
            failure_message: Some(reason.into()),
            stack_trace: None,
        }
    }
}

/// A log line as handed over by the host framework
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: shared::LogLevel,
    pub text: String,
    pub component: Option<String>,
    pub channel: Option<String>,
}

impl LogRecord {
    pub fn new(level: shared::LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            component: None,
            channel: None,
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(shared::LogLevel::Info, text)
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}
