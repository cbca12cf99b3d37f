//! Linux/Android backend on top of `inotify(7)` (§4.2).
//!
//! Grounded on the teacher's `notify/src/inotify.rs` for overall shape (one
//! dedicated thread blocking in a read loop, a registry the calling thread
//! also touches) and on `original_source/src/efsw/FileWatcherInotify.cpp`
//! for the exact semantics: the watched mask, the eager recursive walk at
//! `add_watch` time, and the read-buffer sizing formula
//! `(sizeof(inotify_event) + FILENAME_MAX) * 1024`. Inotify never pairs a
//! rename's two halves itself (`FileWatcherInotify.cpp:248-250` dispatches
//! `Delete` unconditionally on `IN_MOVED_FROM`, with no cookie tracking), so
//! neither does this backend: a rename surfaces as an independent `Delete`
//! then `Add`, exactly as a plain move-out-and-create-elsewhere would.

use crate::action::{Dispatcher, FileAction, Listener};
use crate::engine::{Config, RecursiveMode, WatcherEngine};
use crate::error::{Error, Result};
use crate::fs_util;
use crate::registry::{WatchId, WatchRegistry};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use walkdir::WalkDir;

/// `(sizeof(struct inotify_event) + FILENAME_MAX) * 1024`, matching the
/// teacher's `BUFF_SIZE` macro. `inotify_event` itself is 16 bytes on
/// Linux; `FILENAME_MAX` is 4096.
const BUFFER_SIZE: usize = (16 + 4096) * 1024;

fn watch_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_TO
        | WatchMask::CREATE
        | WatchMask::MOVED_FROM
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
}

struct Shared {
    inotify: Mutex<Inotify>,
    /// Maps an inotify watch descriptor to the library [`WatchId`]
    /// registered against it, so an inotify event (which only carries the
    /// descriptor) can find its [`WatchEntry`](crate::registry::WatchEntry).
    wd_to_id: Mutex<HashMap<WatchDescriptor, WatchId>>,
    id_to_wd: Mutex<HashMap<WatchId, WatchDescriptor>>,
    registry: Arc<WatchRegistry>,
    follow_symlinks: bool,
}

struct WatchThreadHandle {
    join: JoinHandle<()>,
}

/// Engine backed by Linux's `inotify` facility.
pub struct InotifyEngine {
    shared: Arc<Shared>,
    thread: Mutex<Option<WatchThreadHandle>>,
}

impl InotifyEngine {
    fn register_os_watch(shared: &Shared, dir: &Path) -> Result<WatchDescriptor> {
        shared
            .inotify
            .lock()
            .unwrap()
            .watches()
            .add(dir, watch_mask())
            .map_err(|e| Error::io(dir, e))
    }

    /// Registers a single directory: an OS-level watch plus one registry
    /// entry. Does not look at its children.
    fn register_directory(
        shared: &Arc<Shared>,
        dir: &Path,
        listener: Arc<dyn Listener>,
        recursive: bool,
        ancestor: Option<WatchId>,
    ) -> Result<WatchId> {
        let wd = Self::register_os_watch(shared, dir)?;
        let id = shared.registry.insert(dir.to_path_buf(), listener, recursive, ancestor);

        shared.wd_to_id.lock().unwrap().insert(wd.clone(), id);
        shared.id_to_wd.lock().unwrap().insert(id, wd);
        Ok(id)
    }

    /// Registers `dir` and, if `recursive`, every subdirectory beneath it
    /// that isn't already watched (§4.2: "unless a watch with that exact
    /// directory already exists"). The subtree walk is delegated to
    /// `walkdir` rather than hand-rolled recursion through `fs_util::list_dir`.
    fn add_watch_inner(
        shared: &Arc<Shared>,
        dir: &Path,
        listener: Arc<dyn Listener>,
        recursive: bool,
        ancestor: Option<WatchId>,
    ) -> Result<WatchId> {
        let id = Self::register_directory(shared, dir, listener.clone(), recursive, ancestor)?;

        if recursive {
            let root_id = ancestor.unwrap_or(id);
            let walker = WalkDir::new(dir).min_depth(1).follow_links(shared.follow_symlinks);
            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_dir() {
                    continue;
                }
                let path = entry.path();
                if shared.registry.contains_path(path) {
                    continue;
                }
                let _ = Self::register_directory(shared, path, listener.clone(), true, Some(root_id));
            }
        }

        Ok(id)
    }

    fn remove_os_watch(shared: &Shared, id: WatchId) {
        if let Some(wd) = shared.id_to_wd.lock().unwrap().remove(&id) {
            shared.wd_to_id.lock().unwrap().remove(&wd);
            let _ = shared.inotify.lock().unwrap().watches().remove(wd);
        }
    }

    fn run(shared: Arc<Shared>) {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        log::debug!("dirwatch inotify loop started");
        loop {
            let events = {
                let mut inotify = shared.inotify.lock().unwrap();
                match inotify.read_events_blocking(&mut buffer) {
                    Ok(events) => events.collect::<Vec<_>>(),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            };
            if events.is_empty() {
                // An empty read with no error means the inotify fd was
                // closed from under us (engine dropped); stop.
                break;
            }

            let dispatcher = Dispatcher::new(&shared.registry);
            for event in events {
                let Some(&watch_id) = shared.wd_to_id.lock().unwrap().get(&event.wd) else {
                    log::trace!("inotify event for unknown descriptor, dropping");
                    continue;
                };
                let Some(entry) = shared.registry.get(watch_id) else {
                    continue;
                };
                let dir_str = entry.directory_string();
                let name = event
                    .name
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                // A single kernel event may carry several of these bits at
                // once; each is normalized and dispatched independently
                // (§4.2), so these are plain `if`s, not an `if`/`else if`
                // chain. Renames are never paired here: `MOVED_FROM` is
                // always a `Delete`, `MOVED_TO` is always an `Add` (§4.2,
                // §8 Scenario 4).
                if event.mask.contains(EventMask::MOVED_FROM) {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Delete);
                }
                if event.mask.contains(EventMask::MOVED_TO) {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Add);
                    if entry.recursive && event.mask.contains(EventMask::ISDIR) {
                        let full_path = entry.root.join(&name);
                        if !shared.registry.contains_path(&full_path) {
                            let root_id = entry.ancestor.unwrap_or(watch_id);
                            if let Some(listener) = shared.registry.get(watch_id).map(|e| e.listener) {
                                let _ = Self::add_watch_inner(&shared, &full_path, listener, true, Some(root_id));
                            }
                        }
                    }
                }
                if event.mask.contains(EventMask::CREATE) {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Add);
                    if entry.recursive && event.mask.contains(EventMask::ISDIR) {
                        let full_path = entry.root.join(&name);
                        if !shared.registry.contains_path(&full_path) {
                            let root_id = entry.ancestor.unwrap_or(watch_id);
                            let _ = Self::add_watch_inner(
                                &shared,
                                &full_path,
                                entry.listener.clone(),
                                true,
                                Some(root_id),
                            );
                        }
                    }
                }
                if event.mask.contains(EventMask::DELETE) {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Delete);
                }
                if event.mask.contains(EventMask::CLOSE_WRITE) {
                    dispatcher.dispatch_via(watch_id, &dir_str, &name, FileAction::Modified);
                }
                if event.mask.contains(EventMask::DELETE_SELF) {
                    for cascaded in shared.registry.cascade_ids(watch_id) {
                        Self::remove_os_watch(&shared, cascaded);
                        shared.registry.remove(cascaded);
                    }
                }
            }
        }
        log::debug!("dirwatch inotify loop stopped");
    }
}

impl WatcherEngine for InotifyEngine {
    fn new(config: Config) -> Result<Self> {
        let inotify = Inotify::init().map_err(|e| Error::generic(e.to_string()))?;
        let shared = Arc::new(Shared {
            inotify: Mutex::new(inotify),
            wd_to_id: Mutex::new(HashMap::new()),
            id_to_wd: Mutex::new(HashMap::new()),
            registry: Arc::new(WatchRegistry::new()),
            follow_symlinks: config.follow_symlinks(),
        });
        Ok(InotifyEngine {
            shared,
            thread: Mutex::new(None),
        })
    }

    fn add_watch(&self, path: &Path, listener: Arc<dyn Listener>, mode: RecursiveMode) -> Result<WatchId> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let root = fs_util::normalize_root(path);
        Self::add_watch_inner(&self.shared, &root, listener, mode.is_recursive(), None)
    }

    fn remove_watch_path(&self, path: &Path) {
        if let Some(id) = self.shared.registry.find_by_path(path) {
            self.remove_watch_id(id);
        }
    }

    fn remove_watch_id(&self, id: WatchId) {
        for cascaded in self.shared.registry.cascade_ids(id) {
            Self::remove_os_watch(&self.shared, cascaded);
            self.shared.registry.remove(cascaded);
        }
    }

    fn watch(&self) {
        let mut guard = self.thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let join = thread::Builder::new()
            .name("dirwatch inotify loop".into())
            .spawn(move || Self::run(shared))
            .expect("failed to spawn inotify loop");
        *guard = Some(WatchThreadHandle { join });
    }

    fn directories(&self) -> Vec<String> {
        self.shared.registry.directories()
    }
}

impl Drop for InotifyEngine {
    fn drop(&mut self) {
        // Dropping `self.shared.inotify`'s fd unblocks the blocking read in
        // the loop thread with an empty/error result, which makes `run`
        // return; we still join to avoid leaking a detached thread.
        let raw_fd = self.shared.inotify.lock().unwrap().as_raw_fd();
        unsafe {
            libc::close(raw_fd);
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;

    struct Forwarder(Sender<(String, String, FileAction)>);

    impl Listener for Forwarder {
        fn handle_file_action(&self, _id: WatchId, dir: &str, file: &str, action: FileAction) {
            let _ = self.0.send((dir.to_string(), file.to_string(), action));
        }
    }

    fn recv(rx: &Receiver<(String, String, FileAction)>) -> (String, String, FileAction) {
        rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for an inotify event")
    }

    #[test]
    fn detects_create_modify_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let engine = InotifyEngine::new(Config::default()).unwrap();
        engine
            .add_watch(dir.path(), Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
            .unwrap();
        engine.watch();

        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hi").unwrap();
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "a.txt");
        assert_eq!(action, FileAction::Add);

        let mut f = std::fs::OpenOptions::new().write(true).open(&file_path).unwrap();
        f.write_all(b"more").unwrap();
        drop(f);
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
        let engine = InotifyEngine::new(Config::default()).unwrap();
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
    fn rename_within_watched_directory_is_delete_then_add() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("x");
        std::fs::write(&old_path, b"hi").unwrap();

        let (tx, rx) = channel();
        let engine = InotifyEngine::new(Config::default()).unwrap();
        engine
            .add_watch(dir.path(), Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
            .unwrap();
        engine.watch();

        std::fs::rename(&old_path, dir.path().join("y")).unwrap();

        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "x");
        assert_eq!(action, FileAction::Delete);
        let (_dir, name, action) = recv(&rx);
        assert_eq!(name, "y");
        assert_eq!(action, FileAction::Add);
    }

    #[test]
    fn recursive_add_on_preexisting_tree_registers_each_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("child")).unwrap();

        let (tx, _rx) = channel();
        let engine = InotifyEngine::new(Config::default()).unwrap();
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
