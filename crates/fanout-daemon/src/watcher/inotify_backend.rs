//! inotify backend (Linux)

use std::ffi::OsString;
use std::io;
use std::path::Path;

use futures_util::StreamExt;
use inotify::{Event, EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RawEvent, RawKind, WatchBackend, WatchError, Watcher};

/// Kernel read buffer; fits many events with full-length names
const EVENT_BUFFER_SIZE: usize = 4096;

type Stream = EventStream<[u8; EVENT_BUFFER_SIZE]>;

/// Recursive watcher driven by inotify
pub type InotifyWatcher = Watcher<InotifyBackend>;

fn watch_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
}

pub struct InotifyBackend {
    watches: Watches,
    stream: Option<Stream>,
}

impl InotifyBackend {
    /// Open an inotify instance. Must be called within a tokio runtime.
    pub fn new() -> io::Result<Self> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        let stream = inotify.into_event_stream([0u8; EVENT_BUFFER_SIZE])?;
        Ok(Self {
            watches,
            stream: Some(stream),
        })
    }

    fn take_stream(&mut self) -> Option<Stream> {
        self.stream.take()
    }
}

impl WatchBackend for InotifyBackend {
    type Handle = WatchDescriptor;

    fn add_watch(&mut self, dir: &Path) -> io::Result<WatchDescriptor> {
        self.watches.add(dir, watch_mask())
    }

    fn remove_watch(&mut self, handle: &WatchDescriptor) -> io::Result<()> {
        self.watches.remove(handle.clone())
    }
}

fn translate(event: Event<OsString>) -> Option<RawEvent<WatchDescriptor>> {
    let mask = event.mask;

    if mask.contains(EventMask::Q_OVERFLOW) {
        return Some(RawEvent::overflow());
    }

    let kind = if mask.contains(EventMask::CLOSE_WRITE) {
        RawKind::CloseWrite
    } else if mask.contains(EventMask::CREATE) {
        RawKind::Create
    } else if mask.contains(EventMask::DELETE) {
        RawKind::Delete
    } else if mask.contains(EventMask::MOVED_FROM) {
        RawKind::MovedFrom
    } else if mask.contains(EventMask::MOVED_TO) {
        RawKind::MovedTo
    } else if mask.contains(EventMask::IGNORED) {
        RawKind::Ignored
    } else {
        warn!("unexpected inotify event {:?}", mask);
        return None;
    };

    Some(RawEvent {
        handle: Some(event.wd),
        kind,
        name: event.name,
        is_dir: mask.contains(EventMask::ISDIR),
    })
}

impl Watcher<InotifyBackend> {
    /// Watch `root` recursively. Must be called within a tokio runtime;
    /// events flow once [`run`](Self::run) or [`spawn`](Self::spawn) is
    /// driving the notification stream.
    pub fn watch(root: impl AsRef<Path>) -> Result<Self, WatchError> {
        let backend = InotifyBackend::new().map_err(|source| WatchError::Setup {
            path: root.as_ref().to_path_buf(),
            source,
        })?;
        Self::with_backend(root, backend)
    }

    /// Pump notifications until [`close`](Self::close) is called.
    pub async fn run(&self) -> Result<(), WatchError> {
        let mut stream = self
            .with_backend_mut(InotifyBackend::take_stream)
            .ok_or(WatchError::AlreadyRunning)?;
        let shutdown = self.shutdown.clone();

        loop {
            if self.is_closed() {
                break;
            }

            tokio::select! {
                _ = shutdown.notified() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let Some(raw) = translate(event) {
                            self.process(raw);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("inotify read failed: {}", e);
                        return Err(WatchError::Io(e));
                    }
                    None => {
                        debug!("inotify stream ended");
                        break;
                    }
                },
            }
        }

        info!("watcher loop stopped");
        Ok(())
    }

    /// Run the notification pump on a background task
    pub fn spawn(&self) -> JoinHandle<Result<(), WatchError>> {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.run().await })
    }
}
