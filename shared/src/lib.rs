//! Shared types for the run event streaming system
//!
//! Contains the wire contract between a streaming client and a collector:
//! the event model, the versioned messages and the codec error type, plus
//! logging helpers used by every component.

pub mod types;
pub mod events;
pub mod errors;
pub mod messages;
pub mod logging;

pub use types::*;
pub use errors::*;
pub use events::{AttachmentPayload, Event, SequencedEvent};

pub use messages::{
    // Streaming client → collector
    ClientMessage, Hello,

    // Collector → streaming client
    ServerMessage, HandshakeResponse, ControlMessage,

    PROTOCOL_VERSION,
};
