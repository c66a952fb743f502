//! Fanout Core - Shared types, wire protocol, and configuration
//!
//! This crate contains the foundational types used across all Fanout components.
//! It has no dependencies on networking or filesystem notification code.

pub mod config;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use config::{Config, ConfigError, MirrorConfig, ReconnectConfig, ServerConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Default port for the relay and file server
pub const DEFAULT_PORT: u16 = 8888;

/// Default number of concurrent downloads per mirror
pub const DEFAULT_WORKERS: usize = 3;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// WebSocket path the relay publishes events on
pub const EVENTS_PATH: &str = "/events";
