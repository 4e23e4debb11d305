//! Session state shared between the connection manager and the client

use std::sync::{Arc, Mutex};

use crate::error::StreamerError;

/// What the run has learned from the collector so far
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    /// Run id requested through config, if any
    pub requested_run_id: Option<String>,
    /// Authoritative run id; the collector's assignment wins
    pub run_id: Option<String>,
    pub run_url: Option<String>,
    pub group_url: Option<String>,
    pub terminal_error: Option<StreamerError>,
    pub acknowledged_events: u64,
    /// Events that will never reach the collector
    pub undelivered_events: u64,
    pub reconnects: u32,
    pub warnings: Vec<String>,
}

impl SessionInfo {
    pub fn new(requested_run_id: Option<String>) -> Self {
        Self {
            run_id: requested_run_id.clone(),
            requested_run_id,
            ..Self::default()
        }
    }

    /// Record a run id handed out by the collector
    ///
    /// Returns a warning when it differs from the one requested in config.
    pub fn assign_run_id(&mut self, assigned: &str) -> Option<String> {
        let warning = match &self.requested_run_id {
            Some(requested) if requested != assigned => Some(format!(
                "collector assigned run id '{assigned}' instead of configured '{requested}'"
            )),
            _ => None,
        };
        if let Some(warning) = &warning {
            if !self.warnings.contains(warning) {
                self.warnings.push(warning.clone());
            }
        }
        self.run_id = Some(assigned.to_string());
        warning
    }
}

/// Shared session wrapper
pub type SharedSessionInfo = Arc<Mutex<SessionInfo>>;

/// Create new shared session state
pub fn create_shared_session(requested_run_id: Option<String>) -> SharedSessionInfo {
    Arc::new(Mutex::new(SessionInfo::new(requested_run_id)))
}

/// Run `f` against the session, recovering from a poisoned lock
pub fn with_session<R>(session: &SharedSessionInfo, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
    let mut guard = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}
