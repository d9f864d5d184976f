//! The child → parent message protocol.
//!
//! A test process reports progress by printing single-line JSON objects on
//! stdout. Lines that parse as an object with a string `type` field are
//! messages; everything else is plain output. The engine interprets only
//! `worker-status` messages and forwards every message to listeners.
//!
//! ```text
//! {"type":"worker-status","status":"started","name":"Login works"}
//! {"type":"worker-status","status":"finished","name":"Login works","passed":true}
//! ```

use serde::{Deserialize, Serialize};

pub const WORKER_STATUS: &str = "worker-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Started,
    Finished,
}

/// Body of a `worker-status` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub status: StatusKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WorkerStatus {
    /// The `finished` message sent on behalf of a child that never sent one.
    pub fn synthesized_finish(name: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Finished,
            name: name.into(),
            passed: Some(false),
            metadata: None,
        }
    }

    /// Wire form, including the `type` tag.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "type".to_string(),
                serde_json::Value::String(WORKER_STATUS.to_string()),
            );
        }
        value
    }
}

/// A message received from a child process.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    Status(WorkerStatus),
    /// Any other typed message, passed through untouched.
    Other(serde_json::Value),
}

impl ChildMessage {
    /// Parses one stdout line. Returns `None` for plain output.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let kind = value.get("type")?.as_str()?;

        if kind == WORKER_STATUS
            && let Ok(status) = serde_json::from_value::<WorkerStatus>(value.clone())
        {
            return Some(Self::Status(status));
        }
        Some(Self::Other(value))
    }

    pub fn status(&self) -> Option<&WorkerStatus> {
        match self {
            Self::Status(status) => Some(status),
            Self::Other(_) => None,
        }
    }
}
