//! Watch set bookkeeping
//!
//! Bidirectional map between watch handles and the directories they cover.
//! The path side is ordered, so every descendant of a directory sits in one
//! contiguous range (paths compare component by component).

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct WatchSet<H> {
    by_handle: HashMap<H, PathBuf>,
    by_path: BTreeMap<PathBuf, H>,
}

impl<H: Clone + Eq + Hash> WatchSet<H> {
    pub fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_path: BTreeMap::new(),
        }
    }

    /// Record that `handle` covers `dir`.
    ///
    /// Any stale mapping on either side is dropped first, so there is always
    /// exactly one handle per directory.
    pub fn insert(&mut self, handle: H, dir: PathBuf) {
        if let Some(old_dir) = self.by_handle.remove(&handle) {
            self.by_path.remove(&old_dir);
        }
        if let Some(old_handle) = self.by_path.remove(&dir) {
            self.by_handle.remove(&old_handle);
        }
        self.by_handle.insert(handle.clone(), dir.clone());
        self.by_path.insert(dir, handle);
    }

    pub fn dir_of(&self, handle: &H) -> Option<&Path> {
        self.by_handle.get(handle).map(PathBuf::as_path)
    }

    pub fn handle_of(&self, dir: &Path) -> Option<&H> {
        self.by_path.get(dir)
    }

    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.by_path.contains_key(dir)
    }

    pub fn remove_handle(&mut self, handle: &H) -> Option<PathBuf> {
        let dir = self.by_handle.remove(handle)?;
        self.by_path.remove(&dir);
        Some(dir)
    }

    /// Remove `dir` and every directory below it, returning what was removed.
    pub fn drain_subtree(&mut self, dir: &Path) -> Vec<(H, PathBuf)> {
        let doomed: Vec<PathBuf> = self
            .by_path
            .range(dir.to_path_buf()..)
            .take_while(|(path, _)| path.starts_with(dir))
            .map(|(path, _)| path.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|path| {
                let handle = self.by_path.remove(&path)?;
                self.by_handle.remove(&handle);
                Some((handle, path))
            })
            .collect()
    }

    /// Remove everything.
    pub fn drain_all(&mut self) -> Vec<(H, PathBuf)> {
        self.by_handle.clear();
        std::mem::take(&mut self.by_path)
            .into_iter()
            .map(|(path, handle)| (handle, path))
            .collect()
    }

    /// Watched directories in path order
    pub fn dirs(&self) -> impl Iterator<Item = &Path> {
        self.by_path.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

impl<H: Clone + Eq + Hash> Default for WatchSet<H> {
    fn default() -> Self {
        Self::new()
    }
}
