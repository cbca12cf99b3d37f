//! Stub engine implementation.
//!
//! Grounded on the teacher's `notify::NullWatcher` (`notify/src/null.rs`):
//! exists purely so generic code written against [`WatcherEngine`] has
//! something cheap to instantiate in unit tests. Events are never
//! delivered.

use crate::action::Listener;
use crate::engine::{Config, RecursiveMode, WatcherEngine};
use crate::error::Result;
use crate::registry::{WatchId, WatchRegistry};
use std::path::Path;
use std::sync::Arc;

/// Engine that accepts watches but never reports events.
#[derive(Debug, Default)]
pub struct NullEngine {
    registry: WatchRegistry,
}

impl WatcherEngine for NullEngine {
    fn new(_config: Config) -> Result<Self> {
        Ok(NullEngine::default())
    }

    fn add_watch(&self, path: &Path, listener: Arc<dyn Listener>, mode: RecursiveMode) -> Result<WatchId> {
        let root = crate::fs_util::normalize_root(path);
        Ok(self.registry.insert(root, listener, mode.is_recursive(), None))
    }

    fn remove_watch_path(&self, path: &Path) {
        if let Some(id) = self.registry.find_by_path(path) {
            self.registry.remove(id);
        }
    }

    fn remove_watch_id(&self, id: WatchId) {
        self.registry.remove(id);
    }

    fn watch(&self) {}

    fn directories(&self) -> Vec<String> {
        self.registry.directories()
    }
}
