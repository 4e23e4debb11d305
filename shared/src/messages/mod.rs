//! Wire messages between the streaming client and the collector
//!
//! Messages are organized by direction:
//! - `client`: streaming client → collector (handshake, event batches, completion)
//! - `server`: collector → streaming client (handshake response, acks, control)
//!
//! Every message is one JSON document per frame, tagged by `"type"`.

pub mod client;
pub mod server;

pub use client::{ClientMessage, Hello};
pub use server::{ControlMessage, HandshakeResponse, ServerMessage};

use crate::errors::{SharedError, SharedResult};

/// Version of the wire contract; bumped on any incompatible change
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a message as a JSON text frame
pub fn encode<T: serde::Serialize>(message: &T) -> SharedResult<String> {
    serde_json::to_string(message).map_err(|e| SharedError::SerializationError { message: e.to_string() })
}

/// Decode a JSON text frame
pub fn decode<T: serde::de::DeserializeOwned>(frame: &str) -> SharedResult<T> {
    serde_json::from_str(frame).map_err(|e| SharedError::DeserializationError { message: e.to_string() })
}
