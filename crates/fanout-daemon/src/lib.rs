//! Fanout Daemon - directory watcher, event relay and mirror downloader
//!
//! This crate provides:
//! - A recursive directory watcher that reports create/update/delete events
//!   with root-relative paths
//! - A relay that publishes those events over WebSocket and serves file
//!   content over HTTP from the same port
//! - A mirror client that follows a relay and keeps a local copy current
//!   through a bounded pool of download workers
//!
//! # Architecture
//!
//! ```text
//!  source host                                   mirror host
//! ┌──────────────────────────────┐            ┌──────────────────────────────┐
//! │ inotify ─► Watcher           │  events    │ MirrorClient                 │
//! │              │ subscribe     │ ─────────► │   │ update(path, stat)       │
//! │              ▼               │  (ws JSON) │   ▼                          │
//! │           RelayServer        │            │ Downloader ─► worker 1..W    │
//! │              │ GET /path     │ ◄───────── │   (registry, one per path)   │
//! └──────────────────────────────┘  (HTTP)    └──────────────────────────────┘
//! ```
//!
//! # Platform Support
//!
//! The watcher backend is inotify, so watching is Linux-only. Mirroring and
//! the [`watcher::WatchBackend`] seam are platform-independent.

pub mod downloader;
pub mod fetcher;
pub mod mirror;
pub mod relay;
pub mod watcher;

pub use downloader::{DownloadError, DownloadReport, Downloader, DownloaderConfig, Submitted};
pub use fetcher::{FetchError, Fetcher, HttpFetcher};
pub use mirror::{MirrorClient, MirrorError, ReconnectPolicy};
pub use relay::RelayServer;
pub use watcher::{SubscriptionId, WatchError, Watcher};

#[cfg(target_os = "linux")]
pub use watcher::InotifyWatcher;
