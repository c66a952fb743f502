//! Mirror client
//!
//! Subscribes to a relay's event stream and turns every `update` into a
//! download. Creates are only logged (the matching update follows once the
//! file is complete) and deletes are not propagated.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use fanout_core::{ReconnectConfig, RelayMessage, EVENTS_PATH};

use crate::downloader::{Downloader, Submitted};

/// Mirror client errors
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },
}

/// Reconnection policy
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

pub struct MirrorClient {
    /// Relay origin, always http(s)
    server: Url,
    downloader: Arc<Downloader>,
    reconnect: ReconnectPolicy,
}

impl MirrorClient {
    /// `server` is the relay origin, e.g. `http://source:8888` (a `ws://`
    /// origin is accepted too).
    pub fn new(
        server: &str,
        downloader: Arc<Downloader>,
        reconnect: ReconnectPolicy,
    ) -> Result<Self, MirrorError> {
        let mut url =
            Url::parse(server).map_err(|e| MirrorError::InvalidUrl(format!("{}: {}", server, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => {
                return Err(MirrorError::InvalidUrl(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        };
        if url.host_str().is_none() {
            return Err(MirrorError::InvalidUrl(format!("{} has no host", server)));
        }
        url.set_scheme(scheme)
            .map_err(|_| MirrorError::InvalidUrl(server.to_string()))?;
        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            server: url,
            downloader,
            reconnect,
        })
    }

    /// WebSocket endpoint events are published on
    pub fn events_url(&self) -> Url {
        let mut url = self.server.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is always permitted
        let _ = url.set_scheme(scheme);
        url.set_path(EVENTS_PATH);
        url
    }

    /// Location a root-relative wire path is served at
    pub fn file_url(&self, path: &str) -> Result<Url, MirrorError> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| MirrorError::InvalidUrl(self.server.to_string()))?
            .clear()
            .extend(path.split('/'));
        Ok(url)
    }

    /// Act on one relay message
    pub fn handle_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::Update { path, stat } => {
                if !stat.is_file() {
                    return;
                }
                let location = match self.file_url(&path) {
                    Ok(location) => location,
                    Err(e) => {
                        warn!("skipping {}: {}", path, e);
                        return;
                    }
                };
                match self.downloader.submit(location.as_str(), stat) {
                    Ok(Submitted::Queued) => debug!("queued {}", path),
                    Ok(Submitted::Refreshed) => debug!("refreshed in-flight {}", path),
                    Err(e) => warn!("skipping {}: {}", path, e),
                }
            }
            RelayMessage::Create { path, .. } => debug!("{} created upstream", path),
            RelayMessage::Delete { path, .. } => debug!("{} deleted upstream, keeping local copy", path),
            RelayMessage::Error { code, message } => warn!("relay error {:?}: {}", code, message),
            RelayMessage::Ping { .. } | RelayMessage::Pong { .. } => {}
        }
    }

    /// Follow the relay, reconnecting per policy. Returns when the
    /// connection ends and reconnection is disabled, or once the attempt
    /// limit is exhausted.
    pub async fn run(&self) -> Result<(), MirrorError> {
        let mut attempts = 0u32;
        let mut delay = self.reconnect.initial_delay;

        loop {
            let outcome = self.session().await;
            if !self.reconnect.enabled {
                return outcome;
            }

            match outcome {
                Ok(()) => {
                    attempts = 0;
                    delay = self.reconnect.initial_delay;
                    info!("relay connection closed");
                }
                Err(e) => warn!("cannot reach relay {}: {}", self.server, e),
            }

            attempts += 1;
            if self.reconnect.max_attempts > 0 && attempts > self.reconnect.max_attempts {
                return Err(MirrorError::GaveUp {
                    attempts: self.reconnect.max_attempts,
                });
            }

            info!("reconnecting in {:?} (attempt {})", delay, attempts);
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, self.reconnect.max_delay);
        }
    }

    /// One connection: `Err` only if it could not be established
    async fn session(&self) -> Result<(), MirrorError> {
        let url = self.events_url();
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!("connected to relay {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                    Ok(message) => self.handle_message(message),
                    Err(e) => warn!("ignoring malformed relay message: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("relay connection error: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }
}
