//! Integration coverage for the generic poller, the one backend guaranteed
//! to run on whatever platform the test suite executes on.

use dirwatch::{Config, FileAction, RecursiveMode, WatcherEngine};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Forwards every callback onto an `mpsc` channel so a test thread can
/// `recv_timeout` for it, since [`dirwatch::Listener`] callbacks fire from
/// the engine's own background thread.
struct Forwarder(Sender<(String, String, FileAction)>);

impl dirwatch::Listener for Forwarder {
    fn handle_file_action(&self, _id: dirwatch::WatchId, directory: &str, filename: &str, action: FileAction) {
        let _ = self.0.send((directory.to_string(), filename.to_string(), action));
    }
}

fn recv_action(rx: &Receiver<(String, String, FileAction)>) -> (String, String, FileAction) {
    rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for a filesystem event")
}

fn short_poll_config() -> Config {
    Config::default().with_poll_interval(Duration::from_millis(30))
}

#[test]
fn detects_file_creation_in_watched_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = channel();
    let engine = dirwatch::PollEngine::new(short_poll_config()).unwrap();
    engine
        .add_watch(dir.path(), std::sync::Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
        .unwrap();
    engine.watch();

    fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    let (_directory, filename, action) = recv_action(&rx);
    assert_eq!(filename, "a.txt");
    assert_eq!(action, FileAction::Add);
}

#[test]
fn detects_modification_of_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("a.txt");
    fs::write(&file_path, b"hello").unwrap();

    let (tx, rx) = channel();
    let engine = dirwatch::PollEngine::new(short_poll_config()).unwrap();
    engine
        .add_watch(dir.path(), std::sync::Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
        .unwrap();
    engine.watch();

    // Give the poller a chance to take its first baseline snapshot before
    // the mutation, or the write could be folded into the initial scan.
    std::thread::sleep(Duration::from_millis(100));
    fs::write(&file_path, b"a longer body than before").unwrap();

    let (_directory, filename, action) = recv_action(&rx);
    assert_eq!(filename, "a.txt");
    assert_eq!(action, FileAction::Modified);
}

#[test]
fn detects_file_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("a.txt");
    fs::write(&file_path, b"hello").unwrap();

    let (tx, rx) = channel();
    let engine = dirwatch::PollEngine::new(short_poll_config()).unwrap();
    engine
        .add_watch(dir.path(), std::sync::Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
        .unwrap();
    engine.watch();

    std::thread::sleep(Duration::from_millis(100));
    fs::remove_file(&file_path).unwrap();

    let (_directory, filename, action) = recv_action(&rx);
    assert_eq!(filename, "a.txt");
    assert_eq!(action, FileAction::Delete);
}

#[test]
fn recursive_watch_covers_subdirectories_created_after_the_fact() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = channel();
    let engine = dirwatch::PollEngine::new(short_poll_config()).unwrap();
    let root_id = engine
        .add_watch(dir.path(), std::sync::Arc::new(Forwarder(tx)), RecursiveMode::Recursive)
        .unwrap();
    engine.watch();

    let subdir = dir.path().join("child");
    fs::create_dir(&subdir).unwrap();

    // The new directory itself is reported first.
    let (_directory, filename, action) = recv_action(&rx);
    assert_eq!(filename, "child");
    assert_eq!(action, FileAction::Add);

    // A file created inside it afterwards must be reported under the same
    // root watch id, not a separate one, per the dispatch-via-ancestor rule.
    fs::write(subdir.join("nested.txt"), b"hi").unwrap();
    let (_directory, filename, action) = recv_action(&rx);
    assert_eq!(filename, "nested.txt");
    assert_eq!(action, FileAction::Add);

    let directories = engine.directories();
    let root_str = dir.path().to_string_lossy().into_owned();
    assert!(directories.iter().any(|d| d.starts_with(&root_str)));
    let _ = root_id;
}

#[test]
fn removing_a_watch_stops_further_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = channel();
    let engine = dirwatch::PollEngine::new(short_poll_config()).unwrap();
    let id = engine
        .add_watch(dir.path(), std::sync::Arc::new(Forwarder(tx)), RecursiveMode::NonRecursive)
        .unwrap();
    engine.watch();

    engine.remove_watch_id(id);
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();

    match rx.recv_timeout(Duration::from_millis(200)) {
        Err(RecvTimeoutError::Timeout) => {}
        other => panic!("expected no events after removal, got {other:?}"),
    }
}

#[test]
fn add_watch_on_missing_path_fails() {
    let engine = dirwatch::PollEngine::new(Config::default()).unwrap();
    let result = engine.add_watch(
        Path::new("/does/not/exist/anywhere"),
        std::sync::Arc::new(Forwarder(channel().0)),
        RecursiveMode::NonRecursive,
    );
    assert!(result.is_err());
}
