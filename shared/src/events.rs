//! Run lifecycle events as they travel to the collector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{LogLevel, MetadataEntry, RunIdentity, TestStatus};

/// One observable step of a test run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    RunStarted {
        identity: RunIdentity,
        metadata: Vec<MetadataEntry>,
        group_metadata: Vec<MetadataEntry>,
    },
    SuiteStarted {
        suite_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    SuiteFinished {
        suite_id: String,
        status: TestStatus,
        duration_ms: u64,
    },
    CaseStarted {
        case_id: String,
        suite_id: String,
        name: String,
    },
    CaseFinished {
        case_id: String,
        status: TestStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack_trace: Option<String>,
    },
    /// A log line; no `scope_id` means the line belongs to the run itself
    LogLine {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_id: Option<String>,
        level: LogLevel,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Attachment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_id: Option<String>,
        file_name: String,
        media_type: String,
        payload: AttachmentPayload,
    },
    RunFinished {
        identity: RunIdentity,
        overall_status: TestStatus,
    },
}

impl Event {
    /// Wire tag of the event, handy for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run_started",
            Event::SuiteStarted { .. } => "suite_started",
            Event::SuiteFinished { .. } => "suite_finished",
            Event::CaseStarted { .. } => "case_started",
            Event::CaseFinished { .. } => "case_finished",
            Event::LogLine { .. } => "log_line",
            Event::Attachment { .. } => "attachment",
            Event::RunFinished { .. } => "run_finished",
        }
    }

    /// Scope (suite or case) the event refers to, if any
    pub fn scope_id(&self) -> Option<&str> {
        match self {
            Event::SuiteStarted { suite_id, .. } | Event::SuiteFinished { suite_id, .. } => Some(suite_id),
            Event::CaseStarted { case_id, .. } | Event::CaseFinished { case_id, .. } => Some(case_id),
            Event::LogLine { scope_id, .. } | Event::Attachment { scope_id, .. } => scope_id.as_deref(),
            Event::RunStarted { .. } | Event::RunFinished { .. } => None,
        }
    }
}

/// Attachment content: inline bytes or a pointer the collector can fetch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachmentPayload {
    Inline {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Reference {
        uri: String,
    },
}

impl AttachmentPayload {
    pub fn len(&self) -> usize {
        match self {
            AttachmentPayload::Inline { data } => data.len(),
            AttachmentPayload::Reference { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An event stamped with its position in the run's global order
///
/// The sequence number is the collector's deduplication key: a resend after a
/// reconnect carries the same number as the original.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: Event,
}

impl SequencedEvent {
    pub fn new(sequence: u64, event: Event) -> Self {
        Self { sequence, event }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
