//! Recursive directory watcher
//!
//! Turns per-directory notifications into a normalized stream of
//! [`WatchEvent`]s with root-relative paths, and keeps watch coverage in step
//! with the tree as directories appear, vanish and move.
//!
//! # Event flow
//!
//! ```text
//!  backend (inotify)        Watcher state (one lock)            subscribers
//!  ─────────────────        ────────────────────────            ───────────
//!  RawEvent{wd,name} ──►  WatchSet: wd → dir                ──►  listener(&event)
//!                         FileRecords: rel path → stat       ──►  mpsc channel
//! ```
//!
//! Translation and delivery happen under the same lock as subscription, so a
//! new subscriber sees the replay of every known file strictly before any
//! live event. Listeners run inline: they must be quick and must not call
//! back into the watcher.

mod backend;
#[cfg(target_os = "linux")]
mod inotify_backend;
mod watch_set;

pub use backend::{RawEvent, RawKind, WatchBackend};
#[cfg(target_os = "linux")]
pub use inotify_backend::{InotifyBackend, InotifyWatcher};
pub use watch_set::WatchSet;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use fanout_core::{EventKind, FileStat, WatchEvent};

/// Watcher errors
#[derive(Error, Debug)]
pub enum WatchError {
    /// The root could not be watched at all
    #[error("cannot watch {path:?}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The notification stream failed
    #[error("notification stream failed: {0}")]
    Io(#[from] io::Error),

    #[error("watcher is already running")]
    AlreadyRunning,
}

/// Identifies a subscription for [`Watcher::unsubscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&WatchEvent) + Send>;

enum Sink {
    Listener(Listener),
    Channel(mpsc::UnboundedSender<WatchEvent>),
    Bounded(mpsc::Sender<WatchEvent>),
}

impl Sink {
    /// Returns false once the receiving end is gone
    fn deliver(&mut self, event: &WatchEvent) -> bool {
        match self {
            Sink::Listener(listener) => {
                listener(event);
                true
            }
            Sink::Channel(tx) => tx.send(event.clone()).is_ok(),
            Sink::Bounded(tx) => match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber fell behind, dropping it");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    sink: Sink,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn wants_known_state(&self) -> bool {
        self.kinds.iter().any(|k| k.wants_known_state())
    }
}

struct WatcherState<B: WatchBackend> {
    root: PathBuf,
    backend: B,
    watches: WatchSet<B::Handle>,
    /// Last known stat per root-relative file path
    files: BTreeMap<PathBuf, FileStat>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    closed: bool,
}

/// Recursive directory watcher over a [`WatchBackend`].
///
/// Cloning is cheap; clones share the same watch set and subscribers.
pub struct Watcher<B: WatchBackend> {
    state: Arc<Mutex<WatcherState<B>>>,
    shutdown: Arc<Notify>,
}

impl<B: WatchBackend> Clone for Watcher<B> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<B: WatchBackend> Watcher<B> {
    /// Watch `root` recursively through `backend`.
    ///
    /// Every file already present is recorded as baseline state (replayed to
    /// subscribers as `Update`). Fails only if the root itself cannot be
    /// watched.
    pub fn with_backend(root: impl AsRef<Path>, backend: B) -> Result<Self, WatchError> {
        let requested = root.as_ref();
        let root = requested.canonicalize().map_err(|source| WatchError::Setup {
            path: requested.to_path_buf(),
            source,
        })?;

        let mut state = WatcherState {
            root: root.clone(),
            backend,
            watches: WatchSet::new(),
            files: BTreeMap::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
            closed: false,
        };

        let handle = state
            .backend
            .add_watch(&root)
            .map_err(|source| WatchError::Setup {
                path: root.clone(),
                source,
            })?;
        info!("watching directory {:?}", root);
        state.watches.insert(handle, root.clone());
        state.scan(&root);

        info!(
            "watcher ready: {} directories, {} files under {:?}",
            state.watches.len(),
            state.files.len(),
            root
        );

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// The normalized root
    pub fn root(&self) -> PathBuf {
        self.state.lock().root.clone()
    }

    /// Register a listener for the given event kinds.
    ///
    /// If `kinds` includes `Create` or `Update`, the listener is first called
    /// once with an `Update` for every currently known file, before any live
    /// event can reach it.
    pub fn subscribe<F>(&self, kinds: &[EventKind], listener: F) -> SubscriptionId
    where
        F: FnMut(&WatchEvent) + Send + 'static,
    {
        self.state
            .lock()
            .subscribe(kinds, Sink::Listener(Box::new(listener)))
    }

    /// Like [`subscribe`](Self::subscribe), delivering into a channel.
    ///
    /// The subscription is dropped once the receiver is dropped.
    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.lock().subscribe(kinds, Sink::Channel(tx));
        (id, rx)
    }

    /// Like [`subscribe_channel`](Self::subscribe_channel), but the receiver
    /// may lag at most `backlog` live events behind. A subscriber that falls
    /// further behind is dropped and its receiver ends.
    ///
    /// The replay of known files always fits on top of the backlog.
    pub fn subscribe_bounded(
        &self,
        kinds: &[EventKind],
        backlog: usize,
    ) -> (SubscriptionId, mpsc::Receiver<WatchEvent>) {
        let mut state = self.state.lock();
        let replay = if kinds.iter().any(|k| k.wants_known_state()) {
            state.files.len()
        } else {
            0
        };
        let (tx, rx) = mpsc::channel(replay + backlog.max(1));
        let id = state.subscribe(kinds, Sink::Bounded(tx));
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    /// Translate one raw notification and deliver the resulting events.
    pub fn process(&self, raw: RawEvent<B::Handle>) {
        self.state.lock().handle(raw);
    }

    /// Release every watch. No further events are produced.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        for (handle, dir) in state.watches.drain_all() {
            debug!("unwatching directory {:?}", dir);
            if let Err(e) = state.backend.remove_watch(&handle) {
                debug!("failed to remove watch on {:?}: {}", dir, e);
            }
        }
        state.subscribers.clear();
        drop(state);

        self.shutdown.notify_one();
        info!("watcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Snapshot of every known file and its last stat, in path order
    pub fn known_files(&self) -> Vec<(PathBuf, FileStat)> {
        self.state
            .lock()
            .files
            .iter()
            .map(|(path, stat)| (path.clone(), stat.clone()))
            .collect()
    }

    /// Snapshot of every watched directory, in path order
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .watches
            .dirs()
            .map(Path::to_path_buf)
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn with_backend_mut<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.state.lock().backend)
    }
}

impl<B: WatchBackend> WatcherState<B> {
    fn subscribe(&mut self, kinds: &[EventKind], sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;

        let mut subscriber = Subscriber {
            id,
            kinds: kinds.to_vec(),
            sink,
        };

        if subscriber.wants_known_state() {
            for (path, stat) in &self.files {
                let event = WatchEvent::Update {
                    path: path.clone(),
                    stat: stat.clone(),
                };
                if !subscriber.sink.deliver(&event) {
                    return id;
                }
            }
            debug!("replayed {} files to subscriber {:?}", self.files.len(), id);
        }

        self.subscribers.push(subscriber);
        id
    }

    fn handle(&mut self, raw: RawEvent<B::Handle>) {
        if self.closed {
            return;
        }

        match raw.kind {
            RawKind::Overflow => {
                warn!("notification queue overflowed, rescanning {:?}", self.root);
                self.resync();
                return;
            }
            RawKind::Ignored => {
                // The backend already dropped this watch; only our books need fixing
                if let Some(handle) = raw.handle {
                    if let Some(dir) = self.watches.remove_handle(&handle) {
                        info!("watch on {:?} invalidated", dir);
                    }
                }
                return;
            }
            _ => {}
        }

        let Some(handle) = raw.handle else {
            return;
        };
        let Some(dir) = self.watches.dir_of(&handle).map(Path::to_path_buf) else {
            debug!("dropping {:?} for unknown watch {:?}", raw.kind, handle);
            return;
        };
        let Some(name) = raw.name else {
            return;
        };
        let path = dir.join(name);

        match (raw.kind, raw.is_dir) {
            (RawKind::CloseWrite, _) => {
                self.update(&path, None);
            }
            (RawKind::Create | RawKind::MovedTo, true) => self.watch_tree(&path),
            (RawKind::Create | RawKind::MovedTo, false) => self.create(&path),
            (RawKind::Delete, true) => self.forget_tree(&path, false),
            (RawKind::MovedFrom, true) => self.forget_tree(&path, true),
            (RawKind::Delete | RawKind::MovedFrom, false) => self.delete(&path),
            (RawKind::Ignored | RawKind::Overflow, _) => {}
        }
    }

    fn add_watch(&mut self, dir: &Path) {
        if self.watches.contains_dir(dir) {
            return;
        }
        match self.backend.add_watch(dir) {
            Ok(handle) => {
                // Same inode reached by another path (bind mount or a followed link)
                if let Some(existing) = self.watches.dir_of(&handle) {
                    warn!("{:?} is already watched as {:?}, skipping", dir, existing);
                    return;
                }
                info!("watching directory {:?}", dir);
                self.watches.insert(handle, dir.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("directory {:?} vanished before it could be watched", dir);
            }
            Err(e) => warn!("failed to watch {:?}: {}", dir, e),
        }
    }

    /// Watch a new directory and announce everything already inside it.
    fn watch_tree(&mut self, dir: &Path) {
        match std::fs::symlink_metadata(dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                debug!("{:?} is not a real directory, not following", dir);
                return;
            }
            Err(e) => {
                debug!("{:?} vanished before it could be watched: {}", dir, e);
                return;
            }
        }
        self.add_watch(dir);
        self.scan(dir);
    }

    /// Walk below `dir`, watching subdirectories and announcing every regular
    /// file as an `Update`. Returns the relative paths of the files seen.
    fn scan(&mut self, dir: &Path) -> BTreeSet<PathBuf> {
        let mut seen = BTreeSet::new();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("skipping unreadable entry under {:?}: {}", dir, e);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.add_watch(entry.path());
            } else if file_type.is_file() {
                match entry.metadata() {
                    Ok(meta) => {
                        if let Some(rel) = self.update(entry.path(), Some(FileStat::from(&meta))) {
                            seen.insert(rel);
                        }
                    }
                    Err(e) => debug!("{:?} vanished during scan: {}", entry.path(), e),
                }
            }
        }

        seen
    }

    fn create(&mut self, path: &Path) {
        let stat = match std::fs::symlink_metadata(path) {
            Ok(meta) => FileStat::from(&meta),
            Err(e) => {
                debug!("{:?} vanished before it could be stat'ed: {}", path, e);
                return;
            }
        };
        if stat.is_dir() {
            self.watch_tree(path);
            return;
        }
        if !stat.is_file() {
            return;
        }
        let Some(rel) = self.relative(path) else {
            return;
        };

        self.files.insert(rel.clone(), stat.clone());
        let hardlinked = stat.nlink > 1;
        self.emit(WatchEvent::Create {
            path: rel.clone(),
            stat: stat.clone(),
        });

        // A new hardlink is complete content, not a freshly allocated file
        if hardlinked {
            self.emit(WatchEvent::Update { path: rel, stat });
        }
    }

    /// Record and announce the current state of a file. Returns its relative
    /// path if an event was emitted.
    fn update(&mut self, path: &Path, stat: Option<FileStat>) -> Option<PathBuf> {
        let stat = match stat {
            Some(stat) => stat,
            None => match std::fs::symlink_metadata(path) {
                Ok(meta) => FileStat::from(&meta),
                Err(e) => {
                    debug!("{:?} vanished before it could be stat'ed: {}", path, e);
                    return None;
                }
            },
        };
        if !stat.is_file() {
            return None;
        }
        let rel = self.relative(path)?;

        self.files.insert(rel.clone(), stat.clone());
        self.emit(WatchEvent::Update {
            path: rel.clone(),
            stat,
        });
        Some(rel)
    }

    fn delete(&mut self, path: &Path) {
        let Some(rel) = self.relative(path) else {
            return;
        };
        self.forget_file(rel);
    }

    fn forget_file(&mut self, rel: PathBuf) {
        if let Some(stat) = self.files.remove(&rel) {
            self.emit(WatchEvent::Delete { path: rel, stat });
        }
    }

    /// Drop coverage of `dir` and everything below it, announcing a delete
    /// for every file last seen there. `remove_watches` is false when the
    /// backend invalidates the watches itself (the directory is gone).
    fn forget_tree(&mut self, dir: &Path, remove_watches: bool) {
        for (handle, watched) in self.watches.drain_subtree(dir) {
            info!("unwatching directory {:?}", watched);
            if remove_watches {
                if let Err(e) = self.backend.remove_watch(&handle) {
                    debug!("failed to remove watch on {:?}: {}", watched, e);
                }
            }
        }

        let Some(prefix) = self.relative(dir) else {
            return;
        };
        let doomed: Vec<PathBuf> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| path.clone())
            .collect();

        for rel in doomed {
            self.forget_file(rel);
        }
    }

    /// Rebuild state from disk after notifications were lost.
    fn resync(&mut self) {
        let stale_dirs: Vec<PathBuf> = self
            .watches
            .dirs()
            .filter(|dir| !dir.is_dir())
            .map(Path::to_path_buf)
            .collect();
        for dir in stale_dirs {
            self.forget_tree(&dir, true);
        }

        let root = self.root.clone();
        self.add_watch(&root);
        let seen = self.scan(&root);

        let vanished: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for rel in vanished {
            self.forget_file(rel);
        }
    }

    fn emit(&mut self, event: WatchEvent) {
        let kind = event.kind();
        debug!("firing {} {:?}", kind, event.path());

        self.subscribers.retain_mut(|subscriber| {
            if !subscriber.wants(kind) {
                return true;
            }
            let alive = subscriber.sink.deliver(&event);
            if !alive {
                debug!("dropping closed subscriber {:?}", subscriber.id);
            }
            alive
        });
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }
}
