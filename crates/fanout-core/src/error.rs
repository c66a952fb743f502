//! Error types for the Fanout wire protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Wire error codes (sent to relay subscribers)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed
    InvalidMessage,

    /// Message type not accepted from subscribers
    Unsupported,

    /// Internal server error
    InternalError,
}

impl From<&ProtocolError> for ErrorCode {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::PathTraversal(_) => ErrorCode::InvalidMessage,
            ProtocolError::Serialization(_) => ErrorCode::InternalError,
            ProtocolError::Deserialization(_) => ErrorCode::InvalidMessage,
        }
    }
}
