//! Fetch a remote file into a local path

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

/// Transport errors
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfers the content at a location into a destination file.
///
/// The destination's parent directory exists when this is called. Whatever
/// was at the destination is replaced.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the number of bytes written
    async fn fetch(&self, location: &Url, dest: &Path) -> Result<u64, FetchError>;
}

/// Plain HTTP GET, streamed to disk
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("fanout/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, location: &Url, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(location.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("fetched {} bytes from {} into {:?}", written, location, dest);
        Ok(written)
    }
}
