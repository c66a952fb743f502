//! Notification backend seam
//!
//! The watcher only needs two things from the OS: install/remove a
//! per-directory watch, and a stream of raw notifications naming the handle
//! they arrived on.

use std::ffi::OsString;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::Path;

/// Installs and removes per-directory watches.
pub trait WatchBackend: Send + 'static {
    /// Opaque watch handle
    type Handle: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Watch a single directory (non-recursive)
    fn add_watch(&mut self, dir: &Path) -> io::Result<Self::Handle>;

    /// Stop watching; only called for handles the backend has not invalidated
    fn remove_watch(&mut self, handle: &Self::Handle) -> io::Result<()>;
}

/// What a raw notification reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawKind {
    /// A file opened for writing was closed
    CloseWrite,
    Create,
    Delete,
    MovedFrom,
    MovedTo,
    /// The backend dropped the watch on its own
    Ignored,
    /// Notifications were lost
    Overflow,
}

/// A raw notification, before translation
#[derive(Clone, Debug)]
pub struct RawEvent<H> {
    /// Handle the notification arrived on (none for overflow)
    pub handle: Option<H>,
    pub kind: RawKind,
    /// Entry name within the watched directory
    pub name: Option<OsString>,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

impl<H> RawEvent<H> {
    pub fn new(handle: H, kind: RawKind, name: impl Into<OsString>, is_dir: bool) -> Self {
        Self {
            handle: Some(handle),
            kind,
            name: Some(name.into()),
            is_dir,
        }
    }

    pub fn ignored(handle: H) -> Self {
        Self {
            handle: Some(handle),
            kind: RawKind::Ignored,
            name: None,
            is_dir: false,
        }
    }

    pub fn overflow() -> Self {
        Self {
            handle: None,
            kind: RawKind::Overflow,
            name: None,
            is_dir: false,
        }
    }
}
