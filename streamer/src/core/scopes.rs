//! Bookkeeping of suite and case scopes opened by the host

use std::collections::HashMap;

use crate::error::{StreamerError, StreamerResult};
use crate::types::ScopeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScopeEntry {
    kind: ScopeKind,
    open: bool,
}

/// Tracks which scope ids were started and which are still open
///
/// An id can be started once per run; finishing requires the scope to be
/// open and of the expected kind.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, ScopeEntry>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, scope_id: &str, kind: ScopeKind) -> StreamerResult<()> {
        if self.scopes.contains_key(scope_id) {
            return Err(StreamerError::ScopeAlreadyStarted { scope_id: scope_id.to_string() });
        }
        self.scopes.insert(scope_id.to_string(), ScopeEntry { kind, open: true });
        Ok(())
    }

    pub fn close(&mut self, scope_id: &str, kind: ScopeKind) -> StreamerResult<()> {
        match self.scopes.get_mut(scope_id) {
            Some(entry) if entry.open && entry.kind == kind => {
                entry.open = false;
                Ok(())
            }
            _ => Err(StreamerError::ScopeNotOpen { scope_id: scope_id.to_string() }),
        }
    }

    /// Fail unless `scope_id` is open, optionally of a given kind
    pub fn require_open(&self, scope_id: &str, kind: Option<ScopeKind>) -> StreamerResult<ScopeKind> {
        match self.scopes.get(scope_id) {
            Some(entry) if entry.open && kind.is_none_or(|k| k == entry.kind) => Ok(entry.kind),
            _ => Err(StreamerError::ScopeNotOpen { scope_id: scope_id.to_string() }),
        }
    }

    /// Ids of scopes still open, for end-of-run diagnostics
    pub fn open_scopes(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .scopes
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        open
    }
}
