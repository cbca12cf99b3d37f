//! Normalized event vocabulary and the listener contract.
//!
//! Every backend, no matter how different its native primitive, ends up
//! calling [`Dispatcher::dispatch`] with one of the four [`FileAction`]
//! variants. This is the "Dispatcher" component of the design (§4.7).

use crate::registry::{WatchId, WatchRegistry};
use std::fmt;

/// A normalized filesystem change, already translated from whatever the
/// native backend reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// A file or directory was created (or moved into the watched tree).
    Add,
    /// A file or directory was removed (or moved out of the watched tree).
    Delete,
    /// A file's contents or metadata changed.
    Modified,
    /// A file or directory was renamed within the same watched directory.
    ///
    /// `old_name` is the bare name it had before the rename; the name
    /// passed to [`Listener::handle_file_action`] is the new name.
    Moved {
        /// The name the entry had before the rename.
        old_name: String,
    },
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAction::Add => write!(f, "Add"),
            FileAction::Delete => write!(f, "Delete"),
            FileAction::Modified => write!(f, "Modified"),
            FileAction::Moved { old_name } => write!(f, "Moved(from {old_name})"),
        }
    }
}

/// Consumer callback sink.
///
/// A single method, invoked synchronously from a backend's I/O thread.
/// Implementations must be reentrant-safe: the same listener may be shared
/// across several watches (even across several backends, in the unusual
/// case where a caller mixes them), and must not call back into the engine
/// that is invoking it, since that would deadlock on the registry mutex.
///
/// # Example
///
/// ```
/// use dirwatch::{FileAction, Listener, WatchId};
///
/// struct Printer;
///
/// impl Listener for Printer {
///     fn handle_file_action(&self, id: WatchId, directory: &str, filename: &str, action: FileAction) {
///         println!("[{id}] {directory}{filename}: {action}");
///     }
/// }
/// ```
pub trait Listener: Send + Sync {
    /// `directory` always ends with the OS path separator; `filename` is a
    /// bare name and never contains a path separator.
    fn handle_file_action(&self, watch_id: WatchId, directory: &str, filename: &str, action: FileAction);
}

impl<F> Listener for F
where
    F: Fn(WatchId, &str, &str, FileAction) + Send + Sync,
{
    fn handle_file_action(&self, watch_id: WatchId, directory: &str, filename: &str, action: FileAction) {
        (self)(watch_id, directory, filename, action)
    }
}

/// Looks a watch's listener up under the registry lock, releases the lock,
/// then invokes it. This is the one chokepoint every backend routes
/// normalized events through, so the "release the lock before calling the
/// listener" rule (§5) only has to be implemented once.
pub struct Dispatcher<'a> {
    registry: &'a WatchRegistry,
}

impl<'a> Dispatcher<'a> {
    /// Creates a dispatcher bound to the given registry.
    pub fn new(registry: &'a WatchRegistry) -> Self {
        Dispatcher { registry }
    }

    /// Dispatches to the watch itself (used when the watch id delivering the
    /// event is already the one that should be reported to the listener).
    pub fn dispatch(&self, watch_id: WatchId, directory: &str, filename: &str, action: FileAction) {
        let Some(entry) = self.registry.get(watch_id) else {
            log::warn!("event for unknown watch id {watch_id}, dropping");
            return;
        };
        log::trace!("dispatch watch={watch_id} dir={directory} file={filename} action={action}");
        entry.listener.handle_file_action(watch_id, directory, filename, action);
    }

    /// Dispatches on behalf of a [`ChildWatch`](crate::registry::WatchEntry),
    /// reporting it under its recursive ancestor's id (§8: "the watch_id
    /// equals the root's id, not the synthetic child's").
    pub fn dispatch_via(&self, reporting_id: WatchId, directory: &str, filename: &str, action: FileAction) {
        let Some(entry) = self.registry.get(reporting_id) else {
            log::warn!("event for unknown watch id {reporting_id}, dropping");
            return;
        };
        let effective_id = entry.ancestor.unwrap_or(reporting_id);
        log::trace!(
            "dispatch watch={reporting_id} (effective={effective_id}) dir={directory} file={filename} action={action}"
        );
        entry.listener.handle_file_action(effective_id, directory, filename, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(WatchId, String, String, FileAction)>>);

    impl Listener for Recorder {
        fn handle_file_action(&self, id: WatchId, dir: &str, file: &str, action: FileAction) {
            self.0.lock().unwrap().push((id, dir.to_string(), file.to_string(), action));
        }
    }

    #[test]
    fn closures_implement_listener() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let listener: Arc<dyn Listener> = Arc::new(
            move |id: WatchId, dir: &str, file: &str, action: FileAction| {
                *seen2.lock().unwrap() = Some((id, dir.to_string(), file.to_string(), action));
            },
        );
        listener.handle_file_action(1, "/tmp/", "a.txt", FileAction::Add);
        assert_eq!(
            seen.lock().unwrap().take(),
            Some((1, "/tmp/".to_string(), "a.txt".to_string(), FileAction::Add))
        );
    }

    #[test]
    fn dispatch_via_reports_under_ancestor_id() {
        let registry = WatchRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let root_id = registry.insert(PathBuf::from("/tmp/root"), recorder.clone(), true, None);
        let child_id = registry.insert(PathBuf::from("/tmp/root/child"), recorder.clone(), true, Some(root_id));

        let dispatcher = Dispatcher::new(&registry);
        dispatcher.dispatch_via(child_id, "/tmp/root/child/", "f.txt", FileAction::Add);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, root_id, "event must report under the recursive ancestor, not the child watch");
    }

    #[test]
    fn dispatch_to_unknown_id_is_silently_dropped() {
        let registry = WatchRegistry::new();
        let dispatcher = Dispatcher::new(&registry);
        dispatcher.dispatch(999, "/tmp/", "f.txt", FileAction::Delete);
    }
}
