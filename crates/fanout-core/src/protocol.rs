//! Relay protocol messages
//!
//! Watcher events travel from the relay to mirror clients as JSON text
//! frames over a WebSocket.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::path::to_wire;
use crate::types::{FileStat, WatchEvent};

/// Messages sent over the relay WebSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// A file appeared under the root
    Create { path: String, stat: FileStat },

    /// A file's content is available (or changed)
    Update { path: String, stat: FileStat },

    /// A file went away; `stat` is the last one known
    Delete { path: String, stat: FileStat },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

impl RelayMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&WatchEvent> for RelayMessage {
    fn from(event: &WatchEvent) -> Self {
        let path = to_wire(event.path());
        let stat = event.stat().clone();
        match event {
            WatchEvent::Create { .. } => Self::Create { path, stat },
            WatchEvent::Update { .. } => Self::Update { path, stat },
            WatchEvent::Delete { .. } => Self::Delete { path, stat },
        }
    }
}
