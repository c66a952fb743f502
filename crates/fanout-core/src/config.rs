//! Fanout configuration
//!
//! One TOML file covers both roles; every section and field is optional.
//! Looked up at:
//! - macOS: ~/Library/Application Support/fanout/config.toml
//! - Linux: ~/.config/fanout/config.toml
//! - Windows: %APPDATA%/fanout/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{DEFAULT_PORT, DEFAULT_WORKERS};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay / file server settings (`fanout serve`)
    pub server: ServerConfig,
    /// Mirror settings (`fanout mirror`)
    pub mirror: MirrorConfig,
    /// Relay reconnection settings for mirrors
    pub reconnect: ReconnectConfig,
}

/// Relay and file server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port serving both events and files
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Relay server URL, e.g. `http://source:8888`
    pub server_url: Option<String>,
    /// Local directory to mirror into
    pub root: Option<PathBuf>,
    /// Concurrent downloads
    pub workers: usize,
    /// Re-fetches allowed while the remote size disagrees and no newer
    /// notification has arrived
    pub max_stale_passes: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            root: None,
            workers: DEFAULT_WORKERS,
            max_stale_passes: 3,
        }
    }
}

/// Relay reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,
    /// Initial delay before first reconnect attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts (milliseconds)
    pub max_delay_ms: u64,
    /// Maximum number of consecutive attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 0,
        }
    }
}

impl Config {
    /// Load from the platform config path, falling back to defaults when
    /// the file is missing or unusable
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            debug!("no config directory on this platform, using defaults");
            return Self::default();
        };
        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("ignoring config {:?}: {}", path, e);
            Self::default()
        })
    }

    /// Load from `path`. A missing file yields defaults; a present but
    /// malformed or inconsistent one is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e.to_string())),
        };

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;

        info!("loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirror.workers == 0 {
            return Err(ConfigError::Invalid("mirror.workers must be at least 1".into()));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms must be positive".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Write to the platform config path, returning where it went
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("wrote config to {:?}", path);
        Ok(())
    }

    /// `<config dir>/fanout/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "fanout", "fanout")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The defaults rendered as TOML
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("cannot read or write config: {0}")]
    Io(String),

    #[error("malformed config: {0}")]
    Parse(String),

    #[error("cannot render config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no configuration directory on this platform")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.mirror.workers, 3);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 0);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [mirror]
            workers = 8
            server_url = "http://source:8888"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mirror.workers, 8);
        assert_eq!(config.mirror.server_url.as_deref(), Some("http://source:8888"));
        // Other values should be defaults
        assert_eq!(config.mirror.max_stale_passes, 3);
        assert_eq!(config.server.port, 8888);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[mirror]"));
        assert!(sample.contains("[reconnect]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.server.port, 8888);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.port = 9999;
        config.mirror.root = Some(PathBuf::from("/srv/mirror"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.mirror.root, Some(PathBuf::from("/srv/mirror")));
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_inconsistent_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[mirror]\nworkers = 0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "[reconnect]\ninitial_delay_ms = 5000\nmax_delay_ms = 10\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));
    }
}
