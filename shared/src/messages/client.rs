//! Streaming client → collector messages

use serde::{Deserialize, Serialize};

use crate::events::SequencedEvent;
use crate::types::{MetadataEntry, RunIdentity};

use super::PROTOCOL_VERSION;

/// Opening message of every connection epoch
///
/// Sent again after each reconnect with the authoritative run id and the
/// oldest sequence number the collector has not acknowledged yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub group_metadata: Vec<MetadataEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<u64>,
}

impl Hello {
    pub fn new(identity: &RunIdentity, metadata: Vec<MetadataEntry>, group_metadata: Vec<MetadataEntry>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            run_id: identity.run_id.clone(),
            run_name: identity.run_name.clone(),
            group_name: identity.group_name.clone(),
            metadata,
            group_metadata,
            resume_from: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Hello(Hello),

    /// One or more events in ascending sequence order
    Events { events: Vec<SequencedEvent> },

    /// The run is over; the collector may answer with `closed`
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_sequence: Option<u64>,
    },
}

impl ClientMessage {
    pub fn event_count(&self) -> usize {
        match self {
            ClientMessage::Events { events } => events.len(),
            _ => 0,
        }
    }
}
