//! Cross-platform file-system change-notification engine.
//!
//! Consumers register directories to observe, optionally recursively, and
//! receive asynchronous notifications whenever files or subdirectories
//! within them are created, modified, removed, or renamed. Four OS
//! facilities are abstracted behind one [`WatcherEngine`] trait — inotify
//! (Linux), kqueue (BSD/older macOS), FSEvents (modern macOS), and
//! `ReadDirectoryChangesW` (Windows) — with a polling [`poll::PollEngine`]
//! fallback for everything else.
//!
//! This crate is the engine layer only: picking a backend at runtime,
//! translating the four-argument callback into whatever shape an
//! application prefers, and CLI demos are left to a thin façade built on
//! top of it.
//!
//! ```no_run
//! use dirwatch::{recommended_engine, Config, FileAction, Listener, RecursiveMode, WatchId, WatcherEngine};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! struct Printer;
//! impl Listener for Printer {
//!     fn handle_file_action(&self, id: WatchId, directory: &str, filename: &str, action: FileAction) {
//!         println!("[{id}] {directory}{filename}: {action}");
//!     }
//! }
//!
//! # fn main() -> dirwatch::Result<()> {
//! let engine = recommended_engine(Config::default())?;
//! engine.add_watch(Path::new("."), Arc::new(Printer), RecursiveMode::Recursive)?;
//! engine.watch();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![allow(clippy::module_inception)]

pub mod action;
pub mod engine;
pub mod error;
mod fs_util;
pub mod null;
pub mod poll;
pub mod registry;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub mod kqueue;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub mod fsevent;

#[cfg(target_os = "windows")]
pub mod windows;

pub use action::{Dispatcher, FileAction, Listener};
pub use engine::{Config, RecursiveMode, WatcherEngine};
pub use error::{Error, Result};
pub use null::NullEngine;
pub use poll::PollEngine;
pub use registry::{WatchEntry, WatchId, WatchRegistry};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use inotify::InotifyEngine;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub use kqueue::KqueueEngine;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub use fsevent::FsEventsEngine;

#[cfg(target_os = "windows")]
pub use windows::Win32Engine;

/// Identifies which concrete engine backs a [`WatcherEngine`] trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EngineKind {
    /// inotify backend (Linux).
    Inotify,
    /// FSEvents backend (macOS).
    FsEvents,
    /// kqueue backend (BSD, optionally macOS).
    Kqueue,
    /// `ReadDirectoryChangesW` backend (Windows).
    Win32,
    /// Generic polling fallback.
    Poll,
    /// Fake engine for testing; never delivers events.
    Null,
}

/// The recommended [`WatcherEngine`] implementation for the current
/// platform, already constructed but not yet started — call
/// [`WatcherEngine::watch`] to begin delivering events.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn recommended_engine(config: Config) -> Result<InotifyEngine> {
    WatcherEngine::new(config)
}

/// The recommended [`WatcherEngine`] implementation for the current
/// platform, already constructed but not yet started — call
/// [`WatcherEngine::watch`] to begin delivering events.
#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub fn recommended_engine(config: Config) -> Result<FsEventsEngine> {
    WatcherEngine::new(config)
}

/// The recommended [`WatcherEngine`] implementation for the current
/// platform, already constructed but not yet started — call
/// [`WatcherEngine::watch`] to begin delivering events.
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue", not(feature = "macos_fsevent"))
))]
pub fn recommended_engine(config: Config) -> Result<KqueueEngine> {
    WatcherEngine::new(config)
}

/// The recommended [`WatcherEngine`] implementation for the current
/// platform, already constructed but not yet started — call
/// [`WatcherEngine::watch`] to begin delivering events.
#[cfg(target_os = "windows")]
pub fn recommended_engine(config: Config) -> Result<Win32Engine> {
    WatcherEngine::new(config)
}

/// The recommended [`WatcherEngine`] implementation for the current
/// platform, already constructed but not yet started — call
/// [`WatcherEngine::watch`] to begin delivering events.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "windows",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
)))]
pub fn recommended_engine(config: Config) -> Result<PollEngine> {
    WatcherEngine::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_safe() {
        let null = NullEngine::new(Config::default()).unwrap();
        let _engine: &dyn WatcherEngine = &null;
    }

    #[test]
    fn test_debug_impls() {
        macro_rules! assert_debug_impl {
            ($t:ty) => {{
                trait NeedsDebug: std::fmt::Debug {}
                impl NeedsDebug for $t {}
            }};
        }
        assert_debug_impl!(Error);
        assert_debug_impl!(FileAction);
        assert_debug_impl!(Config);
        assert_debug_impl!(RecursiveMode);
        assert_debug_impl!(EngineKind);
    }
}
