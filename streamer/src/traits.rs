//! Streamer trait definitions for dependency injection
//!
//! The transport and the process environment sit behind these traits so the
//! connection manager and the config resolver can be driven by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use url::Url;

use shared::{ClientMessage, ServerMessage, TestStatus};
use crate::error::StreamerResult;
use crate::types::{CaseOutcome, LogRecord, StopReport};

/// Read access to environment variables
#[mockall::automock]
pub trait Environment: Send + Sync {
    /// Value of `name`, or `None` when unset
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Opens links to the collector
#[mockall::automock]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh link; each call starts a new connection epoch
    async fn connect(&self, endpoint: &Url) -> StreamerResult<(Box<dyn MessageSink>, Box<dyn MessageSource>)>;
}

/// Write half of a collector link
#[mockall::automock]
#[async_trait]
pub trait MessageSink: Send {
    /// Send one message; an error means the link is gone
    async fn send(&mut self, message: ClientMessage) -> StreamerResult<()>;

    /// Close the link; best effort
    async fn close(&mut self) -> StreamerResult<()>;
}

/// Read half of a collector link
#[mockall::automock]
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, `None` once the collector closed the link
    async fn next_message(&mut self) -> Option<StreamerResult<ServerMessage>>;
}

/// Lifecycle sink driven by a test framework's hooks
///
/// Only caller contract violations (scope/run ordering) are returned as
/// errors. Transport trouble never surfaces here; it is visible through the
/// implementation's status query instead.
pub trait EventSink: Send + Sync {
    fn on_run_start(&self) -> StreamerResult<()>;

    fn on_suite_start(&self, suite_id: &str, name: &str, parent_id: Option<&str>) -> StreamerResult<()>;

    fn on_suite_finish(&self, suite_id: &str, status: TestStatus, duration: std::time::Duration) -> StreamerResult<()>;

    fn on_case_start(&self, case_id: &str, suite_id: &str, name: &str) -> StreamerResult<()>;

    fn on_case_finish(&self, case_id: &str, outcome: CaseOutcome) -> StreamerResult<()>;

    /// `scope_id = None` logs against the run itself
    fn on_log(&self, scope_id: Option<&str>, record: LogRecord) -> StreamerResult<()>;

    fn on_attachment(
        &self,
        scope_id: Option<&str>,
        file_name: &str,
        media_type: &str,
        payload: shared::AttachmentPayload,
    ) -> StreamerResult<()>;

    /// Flushes, closes the link and writes URL files; bounded by the flush timeout
    fn on_run_finish(&self, overall_status: TestStatus) -> StreamerResult<StopReport>;
}
