//! The shared, mutex-guarded map from [`WatchId`] to watch state.
//!
//! Per the design notes (§9), `Watch` and `ChildWatch` are modeled as a
//! single entry type living in one arena (`WatchRegistry`): a child carries
//! only its ancestor's id rather than a pointer back to it, so cascade
//! removal is a lookup instead of a pointer walk, and there is no cyclic
//! ownership to worry about.

use crate::action::Listener;
use crate::fs_util;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Stable, monotonically increasing identifier for a [`WatchEntry`].
///
/// Assigned by the registry; never reused within a process's lifetime, and
/// always strictly greater than zero for a successfully added watch.
pub type WatchId = i64;

/// A registered interest in a directory, or a synthetic entry created while
/// expanding a recursive watch into its subdirectories.
#[derive(Clone)]
pub struct WatchEntry {
    /// Identifier this entry is registered under.
    pub id: WatchId,
    /// Absolute root directory, normalized to end with the OS separator.
    pub root: PathBuf,
    /// Listener to notify of file actions under this entry's root.
    pub listener: Arc<dyn Listener>,
    /// Whether this entry watches subdirectories of its root.
    pub recursive: bool,
    /// `Some(root_id)` if this entry was synthesized for a subdirectory
    /// discovered under a recursive root; `None` for a user-created watch.
    pub ancestor: Option<WatchId>,
}

impl WatchEntry {
    /// `root` rendered as the display form callers see: a string that ends
    /// with the OS path separator.
    pub fn directory_string(&self) -> String {
        fs_util::with_trailing_separator(&self.root)
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<WatchId, WatchEntry>,
}

/// Owns every [`WatchEntry`] for one backend. Guarded by a single mutex,
/// held only for map operations and the cascade prefix-scan — never across
/// a listener callback or an OS syscall (§5).
pub struct WatchRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicI64,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry").field("len", &self.len()).finish()
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        WatchRegistry {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Allocates a fresh id and inserts the entry under it. Never reuses an
    /// id, even across removals.
    pub fn insert(
        &self,
        root: PathBuf,
        listener: Arc<dyn Listener>,
        recursive: bool,
        ancestor: Option<WatchId>,
    ) -> WatchId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = WatchEntry {
            id,
            root,
            listener,
            recursive,
            ancestor,
        };
        self.inner.lock().unwrap().entries.insert(id, entry);
        id
    }

    /// O(log n) lookup-and-remove of a single entry, identified by id.
    /// Does not cascade; callers collect cascade ids first via
    /// [`WatchRegistry::cascade_ids`] then remove each independently, so
    /// that OS-level unregistration (which the registry does not own) can
    /// happen in between (§4.1: cascade before the target's own OS-level
    /// unregistration).
    pub fn remove(&self, id: WatchId) -> Option<WatchEntry> {
        self.inner.lock().unwrap().entries.remove(&id)
    }

    /// O(n) linear scan for the entry whose root matches `path` exactly
    /// (after normalization). Returns its id without removing it.
    pub fn find_by_path(&self, path: &Path) -> Option<WatchId> {
        let normalized = fs_util::normalize_root(path);
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .find(|e| e.root == normalized)
            .map(|e| e.id)
    }

    /// True if some entry is already watching exactly this directory.
    pub fn contains_path(&self, path: &Path) -> bool {
        self.find_by_path(path).is_some()
    }

    /// Collects the ids of `target` plus every entry whose root is nested
    /// inside (or equal to) `target`'s root — i.e. every descendant watch,
    /// user-created or synthetic. Collected eagerly into a `Vec` rather
    /// than removed while iterating, to avoid the iterator-invalidation bug
    /// noted as an open question in §9.
    pub fn cascade_ids(&self, target: WatchId) -> Vec<WatchId> {
        let inner = self.inner.lock().unwrap();
        let Some(target_entry) = inner.entries.get(&target) else {
            return Vec::new();
        };
        let target_root = target_entry.root.clone();
        let mut ids: Vec<WatchId> = inner
            .entries
            .values()
            .filter(|e| e.id != target && e.root.starts_with(&target_root))
            .map(|e| e.id)
            .collect();
        ids.push(target);
        ids
    }

    /// Looks up the entry registered under `id`, if any.
    pub fn get(&self, id: WatchId) -> Option<WatchEntry> {
        self.inner.lock().unwrap().entries.get(&id).cloned()
    }

    /// Snapshot of every registered root, including synthetic child
    /// watches (§4.1: `Directories()`).
    pub fn directories(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|e| e.directory_string())
            .collect()
    }

    /// Number of registered entries, including synthetic child watches.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the registry has no registered entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::FileAction;

    struct Noop;
    impl crate::action::Listener for Noop {
        fn handle_file_action(&self, _: WatchId, _: &str, _: &str, _: FileAction) {}
    }

    #[test]
    fn ids_are_never_reused() {
        let reg = WatchRegistry::new();
        let a = reg.insert(PathBuf::from("/tmp/a"), Arc::new(Noop), false, None);
        reg.remove(a);
        let b = reg.insert(PathBuf::from("/tmp/a"), Arc::new(Noop), false, None);
        assert_ne!(a, b);
    }

    #[test]
    fn cascade_ids_includes_target_and_descendants_only() {
        let reg = WatchRegistry::new();
        let root = reg.insert(PathBuf::from("/tmp/root"), Arc::new(Noop), true, None);
        let child = reg.insert(PathBuf::from("/tmp/root/child"), Arc::new(Noop), true, Some(root));
        let unrelated = reg.insert(PathBuf::from("/tmp/other"), Arc::new(Noop), false, None);

        let mut ids = reg.cascade_ids(root);
        ids.sort();
        let mut expected = vec![root, child];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(!ids.contains(&unrelated));
    }

    #[test]
    fn find_by_path_normalizes_relative_paths() {
        let reg = WatchRegistry::new();
        let abs = fs_util::normalize_root(Path::new("."));
        let id = reg.insert(abs, Arc::new(Noop), false, None);
        assert_eq!(reg.find_by_path(Path::new(".")), Some(id));
    }

    #[test]
    fn directories_end_with_separator() {
        let reg = WatchRegistry::new();
        reg.insert(PathBuf::from("/tmp/dir"), Arc::new(Noop), false, None);
        let dirs = reg.directories();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with(std::path::MAIN_SEPARATOR));
    }
}
