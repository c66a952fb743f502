//! Mirror downloader
//!
//! Fetches remote files into the mirror root with a fixed pool of workers.
//! At most one download per destination is in flight: a second submission
//! for the same destination only refreshes the expected stat, and the worker
//! already handling it keeps fetching until the local size matches.
//!
//! ```text
//! submit(url, stat) ─► registry (dest → Download) ─► FIFO ─► worker 1..W
//!                              ▲                              │
//!                              └──── size check / removal ◄───┘
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use fanout_core::path::resolve_url_path;
use fanout_core::{FileStat, MirrorConfig, DEFAULT_WORKERS};

use crate::fetcher::{FetchError, Fetcher};

/// Capacity of the report broadcast; slow receivers miss old reports
const REPORT_CAPACITY: usize = 256;

/// Download errors, reported per destination
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("transfer failed: {0}")]
    Transport(FetchError),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] io::Error),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("size still {actual} after repeated fetches, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("downloader is closed")]
    Closed,
}

impl From<FetchError> for DownloadError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Io(e) => DownloadError::Filesystem(e),
            other => DownloadError::Transport(other),
        }
    }
}

/// Outcome of [`Downloader::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// A new download was queued
    Queued,
    /// A download for the destination was already in flight; its expected
    /// stat was replaced
    Refreshed,
}

/// Final outcome of one download
#[derive(Debug, Clone)]
pub enum DownloadReport {
    Completed {
        dest: PathBuf,
        size: u64,
        /// Fetches performed; zero if the local copy was already complete
        fetches: u32,
    },
    Failed {
        dest: PathBuf,
        error: Arc<DownloadError>,
    },
}

impl DownloadReport {
    pub fn dest(&self) -> &Path {
        match self {
            DownloadReport::Completed { dest, .. } | DownloadReport::Failed { dest, .. } => dest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Directory remote paths are mapped onto
    pub root: PathBuf,
    /// Concurrent downloads
    pub workers: usize,
    /// Consecutive fetches allowed without a stat refresh while the size
    /// still disagrees (0 = unlimited)
    pub max_stale_passes: u32,
}

impl DownloaderConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            workers: DEFAULT_WORKERS,
            max_stale_passes: 3,
        }
    }

    pub fn from_mirror(root: impl Into<PathBuf>, mirror: &MirrorConfig) -> Self {
        Self {
            root: root.into(),
            workers: mirror.workers,
            max_stale_passes: mirror.max_stale_passes,
        }
    }
}

/// An in-flight download
#[derive(Debug)]
struct Download {
    location: Url,
    stat: FileStat,
    /// Bumped on every refresh
    generation: u64,
    fetches: u32,
}

enum Step {
    Fetch { location: Url, generation: u64 },
    Finished,
}

struct Inner {
    root: PathBuf,
    registry: Mutex<HashMap<PathBuf, Download>>,
    fetcher: Arc<dyn Fetcher>,
    reports: broadcast::Sender<DownloadReport>,
    idle: Notify,
    max_stale_passes: u32,
}

/// Fixed-size pool of download workers
pub struct Downloader {
    inner: Arc<Inner>,
    queue: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Downloader {
    /// Start the worker pool. Must be called within a tokio runtime.
    pub fn new(config: DownloaderConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let inner = Arc::new(Inner {
            root: config.root,
            registry: Mutex::new(HashMap::new()),
            fetcher,
            reports,
            idle: Notify::new(),
            max_stale_passes: config.max_stale_passes,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let count = config.workers.max(1);
        let workers = (0..count)
            .map(|id| tokio::spawn(worker(id, inner.clone(), rx.clone())))
            .collect();

        info!("downloader started with {} workers into {:?}", count, inner.root);

        Self {
            inner,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Request that the file at `location` be mirrored with the given stat.
    ///
    /// The destination is the URL path (percent-decoded) under the mirror
    /// root.
    pub fn submit(&self, location: &str, stat: FileStat) -> Result<Submitted, DownloadError> {
        let location = Url::parse(location)
            .map_err(|e| DownloadError::InvalidLocation(format!("{}: {}", location, e)))?;
        let dest = resolve_url_path(&self.inner.root, location.path())
            .map_err(|e| DownloadError::InvalidLocation(e.to_string()))?;

        let mut registry = self.inner.registry.lock();
        if let Some(download) = registry.get_mut(&dest) {
            debug!(
                "refreshing in-flight download {:?}: size {} -> {}",
                dest, download.stat.size, stat.size
            );
            download.location = location;
            download.stat = stat;
            download.generation += 1;
            return Ok(Submitted::Refreshed);
        }

        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(DownloadError::Closed)?;
        tx.send(dest.clone()).map_err(|_| DownloadError::Closed)?;

        debug!("queued {} -> {:?}", location, dest);
        registry.insert(
            dest,
            Download {
                location,
                stat,
                generation: 0,
                fetches: 0,
            },
        );
        Ok(Submitted::Queued)
    }

    /// Subscribe to completion and failure reports
    pub fn reports(&self) -> broadcast::Receiver<DownloadReport> {
        self.inner.reports.subscribe()
    }

    /// Expected stat of the in-flight download for `dest`, if any
    pub fn in_flight(&self, dest: &Path) -> Option<FileStat> {
        self.inner
            .registry
            .lock()
            .get(dest)
            .map(|download| download.stat.clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Wait until no download is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.registry.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting submissions and abort the workers. Fetches in
    /// progress are abandoned where they stand.
    pub fn close(&self) {
        self.queue.lock().take();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.inner.registry.lock().clear();
        self.inner.idle.notify_waiters();
        info!("downloader closed");
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

async fn worker(
    id: usize,
    inner: Arc<Inner>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PathBuf>>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(dest) = next else {
            break;
        };
        inner.download(dest).await;
    }
    debug!("download worker {} stopped", id);
}

impl Inner {
    /// Fetch until the local size matches the current expected size
    async fn download(&self, dest: PathBuf) {
        let mut last_fetched: Option<u64> = None;
        let mut stale_passes = 0u32;

        loop {
            let local = match tokio::fs::metadata(&dest).await {
                Ok(meta) => Some(meta.len()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => {
                    self.fail(&dest, e.into());
                    return;
                }
            };

            let (location, generation) = match self.next_step(&dest, local, last_fetched, &mut stale_passes) {
                Step::Fetch { location, generation } => (location, generation),
                Step::Finished => return,
            };

            if local.is_none() {
                if let Some(parent) = dest.parent() {
                    if let Err(e) = ensure_dir(parent).await {
                        self.fail(&dest, e.into());
                        return;
                    }
                }
            }

            info!("downloading {} to {:?}", location, dest);
            last_fetched = Some(generation);
            if let Err(e) = self.fetcher.fetch(&location, &dest).await {
                self.fail(&dest, e.into());
                return;
            }
        }
    }

    /// Compare the local size with the expected one and decide, under one
    /// lock acquisition, whether to finish or fetch again.
    fn next_step(
        &self,
        dest: &Path,
        local: Option<u64>,
        last_fetched: Option<u64>,
        stale_passes: &mut u32,
    ) -> Step {
        let mut registry = self.registry.lock();
        let Some(download) = registry.get_mut(dest) else {
            return Step::Finished;
        };
        let expected = download.stat.size;

        if local == Some(expected) {
            let fetches = download.fetches;
            registry.remove(dest);
            info!("finished {:?} ({} bytes)", dest, expected);
            let _ = self.reports.send(DownloadReport::Completed {
                dest: dest.to_path_buf(),
                size: expected,
                fetches,
            });
            if registry.is_empty() {
                self.idle.notify_waiters();
            }
            return Step::Finished;
        }

        if let Some(generation) = last_fetched {
            if generation == download.generation {
                *stale_passes += 1;
            } else {
                *stale_passes = 0;
            }
            if self.max_stale_passes > 0 && *stale_passes >= self.max_stale_passes {
                drop(registry);
                self.fail(
                    dest,
                    DownloadError::SizeMismatch {
                        expected,
                        actual: local.unwrap_or(0),
                    },
                );
                return Step::Finished;
            }
            debug!(
                "{:?} is {:?} bytes, expected {}; fetching again",
                dest, local, expected
            );
        }

        download.fetches += 1;
        Step::Fetch {
            location: download.location.clone(),
            generation: download.generation,
        }
    }

    /// Drop the registry entry so a later submission starts over
    fn fail(&self, dest: &Path, error: DownloadError) {
        let mut registry = self.registry.lock();
        registry.remove(dest);
        warn!("download of {:?} failed: {}", dest, error);
        let _ = self.reports.send(DownloadReport::Failed {
            dest: dest.to_path_buf(),
            error: Arc::new(error),
        });
        if registry.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Create `dir` and any missing ancestors. Losing a creation race to
/// another worker is success.
async fn ensure_dir(dir: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);

    while let Some(current) = cursor {
        match tokio::fs::metadata(current).await {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::other(format!(
                    "{:?} exists and is not a directory",
                    current
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                missing.push(current);
                cursor = current.parent();
            }
            Err(e) => return Err(e),
        }
    }

    for dir in missing.into_iter().rev() {
        match tokio::fs::create_dir(dir).await {
            Ok(()) => debug!("created directory {:?}", dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Serves sizes from an in-memory remote, writing zero-filled files
    #[derive(Default)]
    struct FakeRemote {
        files: Mutex<HashMap<String, u64>>,
        calls: AtomicU32,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        /// (started, release) for holding the first fetch mid-transfer
        hold_first: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl FakeRemote {
        fn with(files: &[(&str, u64)]) -> Self {
            let remote = Self::default();
            for (path, size) in files {
                remote.files.lock().insert(path.to_string(), *size);
            }
            remote
        }

        fn set(&self, path: &str, size: u64) {
            self.files.lock().insert(path.to_string(), size);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeRemote {
        async fn fetch(&self, location: &Url, dest: &Path) -> Result<u64, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let size = self.files.lock().get(location.path()).copied();
            let hold = self.hold_first.lock().take();
            if let Some((started, release)) = hold {
                started.notify_one();
                release.notified().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let size = size.ok_or(FetchError::Status(404))?;
            tokio::fs::write(dest, vec![0u8; size as usize]).await?;
            Ok(size)
        }
    }

    fn start(root: &Path, workers: usize, remote: &Arc<FakeRemote>) -> Downloader {
        let config = DownloaderConfig {
            root: root.to_path_buf(),
            workers,
            max_stale_passes: 3,
        };
        Downloader::new(config, remote.clone())
    }

    async fn idle(downloader: &Downloader) {
        timeout(WAIT, downloader.wait_idle())
            .await
            .expect("downloads did not settle");
    }

    async fn next_report(rx: &mut broadcast::Receiver<DownloadReport>) -> DownloadReport {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_download_completes_and_leaves_registry() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/a.txt", 20)]));
        let downloader = start(dir.path(), 3, &remote);
        let mut reports = downloader.reports();

        let submitted = downloader
            .submit("http://source:8888/a.txt", FileStat::file(20))
            .unwrap();
        assert_eq!(submitted, Submitted::Queued);

        match next_report(&mut reports).await {
            DownloadReport::Completed { dest, size, fetches } => {
                assert_eq!(dest, dir.path().join("a.txt"));
                assert_eq!(size, 20);
                assert_eq!(fetches, 1);
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(std::fs::metadata(dir.path().join("a.txt")).unwrap().len(), 20);
        assert_eq!(downloader.in_flight_count(), 0);
        assert!(downloader.in_flight(&dir.path().join("a.txt")).is_none());
    }

    #[tokio::test]
    async fn test_nested_destination_creates_parents() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/deep/er/file%20name.bin", 7)]));
        let downloader = start(dir.path(), 2, &remote);

        downloader
            .submit("http://source/deep/er/file%20name.bin", FileStat::file(7))
            .unwrap();
        idle(&downloader).await;

        let dest = dir.path().join("deep/er/file name.bin");
        assert_eq!(std::fs::metadata(dest).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_complete_local_copy_is_not_fetched() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), [0u8; 5]).unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/a.txt", 5)]));
        let downloader = start(dir.path(), 1, &remote);
        let mut reports = downloader.reports();

        downloader.submit("http://source/a.txt", FileStat::file(5)).unwrap();

        assert!(matches!(
            next_report(&mut reports).await,
            DownloadReport::Completed { fetches: 0, .. }
        ));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_submit_refreshes_in_flight() {
        let dir = TempDir::new().unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Arc::new(FakeRemote::with(&[("/a.txt", 10)]));
        *remote.hold_first.lock() = Some((started.clone(), release.clone()));
        let downloader = start(dir.path(), 3, &remote);
        let dest = dir.path().join("a.txt");

        assert_eq!(
            downloader.submit("http://source/a.txt", FileStat::file(10)).unwrap(),
            Submitted::Queued
        );
        timeout(WAIT, started.notified()).await.unwrap();

        // The remote grows while the first transfer is still running
        remote.set("/a.txt", 20);
        assert_eq!(
            downloader.submit("http://source/a.txt", FileStat::file(20)).unwrap(),
            Submitted::Refreshed
        );
        assert_eq!(downloader.in_flight_count(), 1);
        assert_eq!(downloader.in_flight(&dest).unwrap().size, 20);

        release.notify_one();
        idle(&downloader).await;

        assert_eq!(remote.calls(), 2);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_pool() {
        let dir = TempDir::new().unwrap();
        let mut remote = FakeRemote::default();
        remote.delay = Duration::from_millis(30);
        for i in 0..8 {
            remote.set(&format!("/f{}.bin", i), 4);
        }
        let remote = Arc::new(remote);
        let downloader = start(dir.path(), 2, &remote);

        for i in 0..8 {
            downloader
                .submit(&format!("http://source/f{}.bin", i), FileStat::file(4))
                .unwrap();
        }
        idle(&downloader).await;

        assert_eq!(remote.calls(), 8);
        let peak = remote.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency was {}", peak);
    }

    #[tokio::test]
    async fn test_resubmit_after_completion_starts_new_download() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/a.txt", 3)]));
        let downloader = start(dir.path(), 1, &remote);

        downloader.submit("http://source/a.txt", FileStat::file(3)).unwrap();
        idle(&downloader).await;

        remote.set("/a.txt", 9);
        assert_eq!(
            downloader.submit("http://source/a.txt", FileStat::file(9)).unwrap(),
            Submitted::Queued
        );
        idle(&downloader).await;

        assert_eq!(remote.calls(), 2);
        assert_eq!(std::fs::metadata(dir.path().join("a.txt")).unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_transport_error_is_isolated() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/good.txt", 2)]));
        let downloader = start(dir.path(), 1, &remote);
        let mut reports = downloader.reports();

        downloader.submit("http://source/missing.txt", FileStat::file(2)).unwrap();
        downloader.submit("http://source/good.txt", FileStat::file(2)).unwrap();

        let first = next_report(&mut reports).await;
        let second = next_report(&mut reports).await;
        match first {
            DownloadReport::Failed { dest, error } => {
                assert_eq!(dest, dir.path().join("missing.txt"));
                assert!(matches!(*error, DownloadError::Transport(FetchError::Status(404))));
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(matches!(second, DownloadReport::Completed { .. }));
        assert_eq!(downloader.in_flight_count(), 0);

        // A later notification restarts from scratch
        remote.set("/missing.txt", 2);
        assert_eq!(
            downloader.submit("http://source/missing.txt", FileStat::file(2)).unwrap(),
            Submitted::Queued
        );
        idle(&downloader).await;
        assert!(dir.path().join("missing.txt").exists());
    }

    #[tokio::test]
    async fn test_stale_size_gives_up() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/short.txt", 5)]));
        let downloader = start(dir.path(), 1, &remote);
        let mut reports = downloader.reports();

        downloader.submit("http://source/short.txt", FileStat::file(10)).unwrap();

        match next_report(&mut reports).await {
            DownloadReport::Failed { error, .. } => assert!(matches!(
                *error,
                DownloadError::SizeMismatch { expected: 10, actual: 5 }
            )),
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(remote.calls(), 3);
        assert_eq!(downloader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_locations_rejected() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let downloader = start(dir.path(), 1, &remote);

        for location in ["not a url", "http://source/", "http://source/..%2Fetc%2Fpasswd"] {
            assert!(
                matches!(
                    downloader.submit(location, FileStat::file(1)),
                    Err(DownloadError::InvalidLocation(_))
                ),
                "{} should be rejected",
                location
            );
        }
        assert_eq!(downloader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_that_is_a_file_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"x").unwrap();
        let remote = Arc::new(FakeRemote::with(&[("/blocker/a.txt", 1)]));
        let downloader = start(dir.path(), 1, &remote);
        let mut reports = downloader.reports();

        downloader.submit("http://source/blocker/a.txt", FileStat::file(1)).unwrap();

        match next_report(&mut reports).await {
            DownloadReport::Failed { error, .. } => {
                assert!(matches!(*error, DownloadError::Filesystem(_)))
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_dir_tolerates_existing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a/b/c");

        ensure_dir(&target).await.unwrap();
        ensure_dir(&target).await.unwrap();
        let left = dir.path().join("x/y");
        let right = dir.path().join("x/z");
        let (first, second) = tokio::join!(ensure_dir(&left), ensure_dir(&right));
        first.unwrap();
        second.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let downloader = start(dir.path(), 1, &remote);

        downloader.close();
        assert!(matches!(
            downloader.submit("http://source/a.txt", FileStat::file(1)),
            Err(DownloadError::Closed)
        ));
        idle(&downloader).await;
    }
}
