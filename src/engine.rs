//! The common contract every backend implements (§4.1).

use crate::action::Listener;
use crate::error::Result;
use crate::registry::WatchId;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Whether a watch should expand into subdirectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecursiveMode {
    /// Watch the directory and all of its subdirectories.
    Recursive,
    /// Watch only the directory itself.
    NonRecursive,
}

impl RecursiveMode {
    /// Returns `true` if this mode watches subdirectories.
    pub fn is_recursive(self) -> bool {
        matches!(self, RecursiveMode::Recursive)
    }
}

/// Runtime configuration. Only the knobs §4 actually names; see
/// `SPEC_FULL.md` §10.3 for why this is narrower than the teacher's
/// `notify::Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    poll_interval: Duration,
    follow_symlinks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval: Duration::from_millis(1000),
            follow_symlinks: false,
        }
    }
}

impl Config {
    /// Interval between generic-poller passes (§4.6). Ignored by the
    /// native backends.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current interval between generic-poller passes.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether the generic poller should follow symlinks while walking.
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Whether the generic poller follows symlinks while walking.
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }
}

/// The per-backend watch engine (§4.1).
///
/// A backend owns one dedicated I/O thread (§5) plus a
/// [`WatchRegistry`](crate::registry::WatchRegistry) the calling thread and
/// that I/O thread both touch. `AddWatch`/`RemoveWatch` are synchronous from
/// the caller's perspective: by the time they return, the registry and the
/// OS-level registration both reflect the change.
pub trait WatcherEngine: Send + Sync {
    /// Constructs a new, unstarted engine.
    fn new(config: Config) -> Result<Self>
    where
        Self: Sized;

    /// Registers interest in `path`. Returns a [`WatchId`] strictly greater
    /// than zero on success.
    ///
    /// A recursive add walks the tree eagerly so that pre-existing
    /// subdirectories are covered from the first kernel notification
    /// onward; no events are synthesized for files or directories that
    /// already existed at add time.
    fn add_watch(
        &self,
        path: &Path,
        listener: Arc<dyn Listener>,
        mode: RecursiveMode,
    ) -> Result<WatchId>;

    /// Removes the watch registered at exactly this path (O(n) scan).
    /// Silent if no such watch exists.
    fn remove_watch_path(&self, path: &Path);

    /// Removes the watch with this id (O(log n) lookup). Silent if the id
    /// is unknown. For a recursive watch, cascades to every descendant
    /// watch first (§4.1).
    fn remove_watch_id(&self, id: WatchId);

    /// Starts the I/O thread. Idempotent: a second call is a no-op.
    fn watch(&self);

    /// Snapshot of every currently registered root, including synthetic
    /// child watches.
    fn directories(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_mode_is_recursive() {
        assert!(RecursiveMode::Recursive.is_recursive());
        assert!(!RecursiveMode::NonRecursive.is_recursive());
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert!(!config.follow_symlinks());
    }

    #[test]
    fn config_builder_overrides() {
        let config = Config::default()
            .with_poll_interval(Duration::from_secs(5))
            .with_follow_symlinks(true);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.follow_symlinks());
    }
}
