//! Collector → streaming client messages

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeResponse {
    pub fn accept(run_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            protocol_version: super::PROTOCOL_VERSION,
            run_id: Some(run_id.into()),
            run_url: None,
            group_url: None,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            protocol_version: super::PROTOCOL_VERSION,
            run_id: None,
            run_url: None,
            group_url: None,
            reason: Some(reason.into()),
        }
    }
}

/// Messages the collector pushes outside the ack flow
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "control", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    RunAssigned {
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_url: Option<String>,
    },
    RunCancelled { reason: String },
    ProtocolVersionMismatch { server_version: u32 },
    Fatal { reason: String },
}

impl ControlMessage {
    /// Whether the message ends the session
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ControlMessage::RunAssigned { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HandshakeResponse(HandshakeResponse),

    /// Every event with `sequence <= ack_up_to` is durably received
    Ack { ack_up_to: u64 },

    Control(ControlMessage),

    /// Close confirmation after `complete`
    Closed,
}
