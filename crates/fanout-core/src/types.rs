//! Core type definitions for Fanout
//!
//! These types are shared by the watcher, the relay and the downloader and
//! define what a change notification carries.

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Type of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    /// FIFO, socket or device node
    Other,
}

/// File attributes carried with every notification (similar to struct stat)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub nlink: u64,
    pub atime: i64,
    pub atime_nsec: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
    pub ctime: i64,
    pub ctime_nsec: u32,
}

impl FileStat {
    /// Attributes for a regular file of the given size, all times zeroed
    pub fn file(size: u64) -> Self {
        Self {
            file_type: FileType::File,
            size,
            mode: 0o644,
            nlink: 1,
            atime: 0,
            atime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
            ctime: 0,
            ctime_nsec: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

impl From<&Metadata> for FileStat {
    #[cfg(unix)]
    fn from(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            file_type: file_type_of(meta),
            size: meta.len(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            atime: meta.atime(),
            atime_nsec: meta.atime_nsec() as u32,
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec() as u32,
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec() as u32,
        }
    }

    #[cfg(not(unix))]
    fn from(meta: &Metadata) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let split = |t: std::io::Result<SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| (d.as_secs() as i64, d.subsec_nanos()))
                .unwrap_or((0, 0))
        };
        let (atime, atime_nsec) = split(meta.accessed());
        let (mtime, mtime_nsec) = split(meta.modified());

        Self {
            file_type: file_type_of(meta),
            size: meta.len(),
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            nlink: 1,
            atime,
            atime_nsec,
            mtime,
            mtime_nsec,
            ctime: mtime,
            ctime_nsec: mtime_nsec,
        }
    }
}

fn file_type_of(meta: &Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_file() {
        FileType::File
    } else {
        FileType::Other
    }
}

/// Kind of change notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    /// Every event kind
    pub const ALL: [EventKind; 3] = [EventKind::Create, EventKind::Update, EventKind::Delete];

    /// Whether subscribing to this kind means wanting the known state replayed
    pub fn wants_known_state(self) -> bool {
        matches!(self, EventKind::Create | EventKind::Update)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A change to a file under a watched root.
///
/// Paths are relative to the root. `Delete` carries the last stat that was
/// known for the file before it went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Create { path: PathBuf, stat: FileStat },
    Update { path: PathBuf, stat: FileStat },
    Delete { path: PathBuf, stat: FileStat },
}

impl WatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Create { .. } => EventKind::Create,
            Self::Update { .. } => EventKind::Update,
            Self::Delete { .. } => EventKind::Delete,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Create { path, .. } | Self::Update { path, .. } | Self::Delete { path, .. } => {
                path
            }
        }
    }

    pub fn stat(&self) -> &FileStat {
        match self {
            Self::Create { stat, .. } | Self::Update { stat, .. } | Self::Delete { stat, .. } => {
                stat
            }
        }
    }
}
