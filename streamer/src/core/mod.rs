//! Core streaming logic, free of I/O

pub mod backoff;
pub mod queue;
pub mod scopes;

pub use backoff::Backoff;
pub use queue::{EnqueueError, OutboundQueue};
pub use scopes::ScopeRegistry;
