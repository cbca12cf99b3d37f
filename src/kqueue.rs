//! BSD/macOS backend on top of `kqueue(2)`'s `EVFILT_VNODE` filter (§4.3).
//!
//! kqueue reports file-level events only — a directory's `NOTE_WRITE` means
//! "a child was added or removed", not which one, and a file's `NOTE_RENAME`
//! does not carry its new name. Strategy, straight from the spec: register
//! an fd (here, via the `kqueue` crate's path-keyed API rather than raw
//! fds) on every watched directory *and* on every one of its children,
//! keep a name table per directory, and rescan that table against a fresh
//! `read_dir` whenever the directory's own fd reports a write. Grounded on
//! `original_source/src/efsw/FileWatcherKqueue.hpp`'s `WatcherKqueue`
//! (`addFile`/`removeFile`/`rescan`/`ChildMap`) for the per-file-fd design,
//! and on the teacher's `notify/src/kqueue.rs` for the `kqueue` crate's API
//! shape (`add_filename`/`remove_filename`/`watch`/`poll`).

use crate::action::{Dispatcher, FileAction, Listener};
use crate::engine::{Config, RecursiveMode, WatcherEngine};
use crate::error::{Error, Result};
use crate::fs_util;
use crate::registry::{WatchId, WatchRegistry};
use kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode, Watcher as KqueueWatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use walkdir::WalkDir;

fn filter_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
        | FilterFlag::NOTE_REVOKE
}

/// The kevent change-list size is bounded (§4.3); the reference
/// implementation's cap (`efsw`'s `MAX_CHANGE_EVENT_SIZE`).
pub const MAX_CHANGE_EVENT_SIZE: usize = 2000;

/// A watched directory: its [`WatchId`] (its own if user-created, or a
/// synthetic `ChildWatch` id if discovered while expanding a recursive
/// root) and the name table rescans diff against.
struct DirNode {
    watch_id: WatchId,
    recursive: bool,
    /// child path -> is this child itself a directory.
    children: HashMap<PathBuf, bool>,
}

struct Shared {
    kqueue: Mutex<KqueueWatcher>,
    dirs: Mutex<HashMap<PathBuf, DirNode>>,
    registry: Arc<WatchRegistry>,
    follow_symlinks: bool,
    /// Entries appended to the kqueue change list since the last flush;
    /// reset on every [`KqueueEngine::flush`] call (§4.3 change-list cap).
    pending_changes: Mutex<usize>,
}

struct WatchThreadHandle {
    join: JoinHandle<()>,
}

/// Engine backed by BSD/macOS `kqueue`.
pub struct KqueueEngine {
    shared: Arc<Shared>,
    thread: Mutex<Option<WatchThreadHandle>>,
}

impl KqueueEngine {
    fn register_fd(shared: &Shared, path: &Path) -> Result<()> {
        shared
            .kqueue
            .lock()
            .unwrap()
            .add_filename(path, EventFilter::EVFILT_VNODE, filter_flags())
            .map_err(|e| Error::io(path, e))?;
        let mut pending = shared.pending_changes.lock().unwrap();
        *pending += 1;
        if *pending >= MAX_CHANGE_EVENT_SIZE {
            drop(pending);
            Self::flush(shared);
        }
        Ok(())
    }

    fn unregister_fd(shared: &Shared, path: &Path) {
        let _ = shared
            .kqueue
            .lock()
            .unwrap()
            .remove_filename(path, EventFilter::EVFILT_VNODE);
    }

    /// Commits every pending `add_filename`/`remove_filename` call to the
    /// kernel via a `kevent` call (the `kqueue` crate's `watch()`).
    fn flush(shared: &Shared) {
        let _ = shared.kqueue.lock().unwrap().watch();
        *shared.pending_changes.lock().unwrap() = 0;
    }

    /// Registers `dir` itself plus every one of its immediate children
    /// (file or subdirectory) — §4.3: "open an fd for every child". Does
    /// not recurse; see [`KqueueEngine::add_directory`].
    fn register_one_directory(
        shared: &Arc<Shared>,
        dir: &Path,
        watch_id: WatchId,
        recursive: bool,
    ) -> Result<()> {
        Self::register_fd(shared, dir)?;

        let mut children = HashMap::new();
        if let Ok(entries) = fs_util::list_dir(dir, shared.follow_symlinks) {
            for entry in entries {
                Self::register_fd(shared, &entry.path)?;
                children.insert(entry.path.clone(), entry.info.is_directory);
            }
        }

        shared.dirs.lock().unwrap().insert(
            dir.to_path_buf(),
            DirNode {
                watch_id,
                recursive,
                children,
            },
        );
        Ok(())
    }

    /// Registers `dir` and, when `recursive`, every subdirectory beneath it
    /// that isn't already watched, via a single `walkdir` traversal rather
    /// than hand-rolled recursive descent. `watch_id` is the id `dir`
    /// itself reports events under; discovered subdirectories get their own
    /// synthetic ids, all pointing at `root_id`.
    fn add_directory(
        shared: &Arc<Shared>,
        dir: &Path,
        watch_id: WatchId,
        root_id: WatchId,
        listener: &Arc<dyn Listener>,
        recursive: bool,
    ) -> Result<()> {
        Self::register_one_directory(shared, dir, watch_id, recursive)?;

        if recursive {
            let walker = WalkDir::new(dir).min_depth(1).follow_links(shared.follow_symlinks);
            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_dir() {
                    continue;
                }
                let path = entry.path();
                if shared.dirs.lock().unwrap().contains_key(path) {
                    continue;
                }
                let child_id = shared.registry.insert(path.to_path_buf(), listener.clone(), true, Some(root_id));
                Self::register_one_directory(shared, path, child_id, true)?;
            }
        }
        Ok(())
    }

    fn remove_directory(shared: &Shared, dir: &Path) {
        if let Some(node) = shared.dirs.lock().unwrap().remove(dir) {
            for child in node.children.keys() {
                Self::unregister_fd(shared, child);
            }
        }
        Self::unregister_fd(shared, dir);
    }

    /// Implements the rescan algorithm (§4.3): diff the directory's current
    /// children against the name table, emitting Add/Delete for the
    /// difference and updating the table and kqueue registrations.
    fn rescan(shared: &Arc<Shared>, dispatcher: &Dispatcher, dir: &Path) {
        let Ok(entries) = fs_util::list_dir(dir, shared.follow_symlinks) else {
            return;
        };
        let current: HashMap<PathBuf, bool> = entries
            .iter()
            .map(|e| (e.path.clone(), e.info.is_directory))
            .collect();

        let (watch_id, recursive, previous) = {
            let dirs = shared.dirs.lock().unwrap();
            let Some(node) = dirs.get(dir) else { return };
            (node.watch_id, node.recursive, node.children.clone())
        };
        let dir_str = fs_util::with_trailing_separator(dir);

        for (path, is_dir) in &current {
            if previous.contains_key(path) {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Add);
            if Self::register_fd(shared, path).is_err() {
                continue;
            }
            if recursive && *is_dir {
                if let Some(listener) = shared.registry.get(watch_id).map(|e| e.listener) {
                    let root_id = shared.registry.get(watch_id).and_then(|e| e.ancestor).unwrap_or(watch_id);
                    let child_id = shared.registry.insert(path.clone(), listener.clone(), true, Some(root_id));
                    let _ = Self::add_directory(shared, path, child_id, root_id, &listener, true);
                }
            }
        }

        for (path, is_dir) in &previous {
            if current.contains_key(path) {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Delete);
            if *is_dir {
                if let Some(child) = shared.dirs.lock().unwrap().get(path) {
                    for cascaded in shared.registry.cascade_ids(child.watch_id) {
                        shared.registry.remove(cascaded);
                    }
                }
                Self::remove_directory(shared, path);
            } else {
                Self::unregister_fd(shared, path);
            }
        }

        if let Some(node) = shared.dirs.lock().unwrap().get_mut(dir) {
            node.children = current;
        }
        Self::flush(shared);
    }

    fn run(shared: Arc<Shared>) {
        log::debug!("dirwatch kqueue loop started");
        loop {
            let event = shared.kqueue.lock().unwrap().poll(None);
            let Some(event) = event else { break };
            log::trace!("kqueue event: {event:?}");

            let kqueue::Event {
                ident: Ident::Filename(_, raw_path),
                data: EventData::Vnode(vnode),
            } = event
            else {
                continue;
            };
            let path = PathBuf::from(raw_path);
            let dispatcher = Dispatcher::new(&shared.registry);

            let is_dir_node = shared.dirs.lock().unwrap().contains_key(&path);
            if is_dir_node {
                match vnode {
                    Vnode::Write | Vnode::Link => Self::rescan(&shared, &dispatcher, &path),
                    Vnode::Delete | Vnode::Revoke => {
                        let watch_id = shared.dirs.lock().unwrap().get(&path).map(|n| n.watch_id);
                        if let Some(watch_id) = watch_id {
                            let (dir_str, name_str) = fs_util::split(&path);
                            dispatcher.dispatch_via(watch_id, &dir_str, &name_str, FileAction::Delete);
                            for cascaded in shared.registry.cascade_ids(watch_id) {
                                shared.registry.remove(cascaded);
                            }
                        }
                        Self::remove_directory(&shared, &path);
                    }
                    // Self-rename of a watched directory can't recover the
                    // new name from kqueue alone; left unhandled, matching
                    // the accepted per-file rename limitation (§4.3).
                    _ => {}
                }
                continue;
            }

            let Some(parent) = path.parent().map(PathBuf::from) else { continue };
            let Some(watch_id) = shared.dirs.lock().unwrap().get(&parent).map(|n| n.watch_id) else {
                continue;
            };
            let (dir_str, name_str) = fs_util::split(&path);
            match vnode {
                Vnode::Write | Vnode::Extend | Vnode::Attrib | Vnode::Truncate => {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name_str, FileAction::Modified);
                }
                Vnode::Delete => {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name_str, FileAction::Delete);
                    Self::unregister_fd(&shared, &path);
                    if let Some(node) = shared.dirs.lock().unwrap().get_mut(&parent) {
                        node.children.remove(&path);
                    }
                }
                Vnode::Rename => Self::rescan(&shared, &dispatcher, &parent),
                _ => {}
            }
        }
        log::debug!("dirwatch kqueue loop stopped");
    }
}

impl WatcherEngine for KqueueEngine {
    fn new(config: Config) -> Result<Self> {
        let kqueue = KqueueWatcher::new().map_err(|e| Error::generic(e.to_string()))?;
        let shared = Arc::new(Shared {
            kqueue: Mutex::new(kqueue),
            dirs: Mutex::new(HashMap::new()),
            registry: Arc::new(WatchRegistry::new()),
            follow_symlinks: config.follow_symlinks(),
            pending_changes: Mutex::new(0),
        });
        Ok(KqueueEngine {
            shared,
            thread: Mutex::new(None),
        })
    }

    fn add_watch(&self, path: &Path, listener: Arc<dyn Listener>, mode: RecursiveMode) -> Result<WatchId> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let root = fs_util::normalize_root(path);
        let recursive = mode.is_recursive();
        let id = self.shared.registry.insert(root.clone(), listener.clone(), recursive, None);
        Self::add_directory(&self.shared, &root, id, id, &listener, recursive)?;
        Self::flush(&self.shared);
        Ok(id)
    }

    fn remove_watch_path(&self, path: &Path) {
        if let Some(id) = self.shared.registry.find_by_path(path) {
            self.remove_watch_id(id);
        }
    }

    fn remove_watch_id(&self, id: WatchId) {
        for cascaded in self.shared.registry.cascade_ids(id) {
            if let Some(entry) = self.shared.registry.get(cascaded) {
                Self::remove_directory(&self.shared, &entry.root);
            }
            self.shared.registry.remove(cascaded);
        }
        Self::flush(&self.shared);
    }

    fn watch(&self) {
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let join = thread::Builder::new()
            .name("dirwatch kqueue loop".into())
            .spawn(move || Self::run(shared))
            .expect("failed to spawn kqueue loop");
        *guard = Some(WatchThreadHandle { join });
    }

    fn directories(&self) -> Vec<String> {
        self.shared.registry.directories()
    }
}

impl Drop for KqueueEngine {
    fn drop(&mut self) {
        // `kqueue.poll(None)` blocks until the next kevent, and there's no
        // portable way to interrupt it from outside; joining here would
        // hang until the next filesystem change. The loop thread keeps its
        // own `Arc<Shared>` and exits once the kernel-side descriptor is
        // closed with the last reference to it, the same shutdown posture
        // efsw's `FileWatcherKqueue` destructor relies on.
        drop(self.thread.lock().unwrap().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;

    struct Forwarder(Sender<(String, String, FileAction)>);

    impl Listener for Forwarder {
        fn handle_file_action(&self, _id: WatchId, dir: &str, file: &str, action: FileAction) {
            let _ = self.0.send((dir.to_string(), file.to_string(), action));
        }
    }

    fn recv(rx: &Receiver<(String, String, FileAction)>) -> (String, String, FileAction) {
        rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for a kqueue event")
    }

    #[test]
    fn detects_create_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let engine = KqueueEngine::new(Config::default()).unwrap();
        engine
            .add_watch(dir.path(), Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
            .unwrap();
        engine.watch();

        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hi").unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "a.txt");
        assert_eq!(action, FileAction::Add);

        std::fs::write(&file_path, b"more data than before").unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "a.txt");
        assert_eq!(action, FileAction::Modified);

        std::fs::remove_file(&file_path).unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "a.txt");
        assert_eq!(action, FileAction::Delete);
    }

    #[test]
    fn recursive_watch_discovers_new_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let engine = KqueueEngine::new(Config::default()).unwrap();
        engine
            .add_watch(dir.path(), Arc::new(Forwarder(tx)), RecursiveMode::Recursive)
            .unwrap();
        engine.watch();

        let subdir = dir.path().join("child");
        std::fs::create_dir(&subdir).unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "child");
        assert_eq!(action, FileAction::Add);

        std::fs::write(subdir.join("nested.txt"), b"hi").unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "nested.txt");
        assert_eq!(action, FileAction::Add);
    }

    #[test]
    fn recursive_add_on_preexisting_tree_registers_each_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("child")).unwrap();

        let (tx, _rx) = channel();
        let engine = KqueueEngine::new(Config::default()).unwrap();
        engine
            .add_watch(dir.path(), Arc::new(Forwarder(tx)), RecursiveMode::Recursive)
            .unwrap();

        let mut dirs = engine.directories();
        dirs.sort();
        let mut unique = dirs.clone();
        unique.dedup();
        assert_eq!(dirs, unique, "add_watch must not register the same directory twice");
        assert_eq!(dirs.len(), 2);
    }
}
