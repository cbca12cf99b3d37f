//! Small filesystem helpers.
//!
//! Per §1 these would normally be supplied by the environment (a shared
//! "path joining, trailing-slash normalization, directory enumeration,
//! stat-like metadata" collaborator used by every backend); this crate has
//! no such external provider, so they live here, grounded on the same
//! `std::fs` + `walkdir` primitives the teacher backends already use
//! directly (`notify/src/inotify.rs`, `notify/src/kqueue.rs`).

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Renders `path` as a string guaranteed to end with [`MAIN_SEPARATOR`].
pub fn with_trailing_separator(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with(MAIN_SEPARATOR) {
        s.push(MAIN_SEPARATOR);
    }
    s
}

/// Normalizes a watch root: absolute-ized relative to the current
/// directory if needed. The trailing separator is applied only when the
/// path is rendered for display/comparison via [`with_trailing_separator`];
/// internally roots are kept as plain `PathBuf`s so `Path::starts_with`
/// (used for cascade removal) behaves componentwise.
pub fn normalize_root(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Splits a full path into its parent directory (with a trailing
/// separator) and bare file name.
pub fn split(path: &Path) -> (String, String) {
    let dir = path.parent().map(with_trailing_separator).unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, name)
}

pub fn is_directory(path: &Path) -> bool {
    path.metadata().map(|m| m.is_dir()).unwrap_or(false)
}

/// Stat-like metadata used by the generic poller's diff algorithm (§4.6,
/// §3 `FileInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_directory: bool,
    /// Inode on Unix, file index on Windows, 0 if unavailable. Used purely
    /// as a change signal, never dereferenced.
    pub inode: u64,
}

impl FileInfo {
    pub fn from_metadata(meta: &Metadata) -> FileInfo {
        FileInfo {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_directory: meta.is_dir(),
            inode: file_handle(meta),
        }
    }
}

#[cfg(unix)]
fn file_handle(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_handle(_meta: &Metadata) -> u64 {
    0
}

/// One entry returned by [`list_dir`].
#[derive(Clone)]
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub path: PathBuf,
    pub info: FileInfo,
}

/// Lists the immediate children of `dir`. Entries that vanish between
/// `read_dir` and `metadata` (a common race under concurrent filesystem
/// activity) are silently skipped rather than surfaced as an error.
///
/// When `follow_symlinks` is true, a child that is itself a symlink is
/// stat'd through to its target (so a symlink to a directory is treated as
/// a directory for recursion purposes); when false, `entry.metadata()` is
/// used as-is, which does not traverse the link.
pub fn list_dir(dir: &Path, follow_symlinks: bool) -> std::io::Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let meta = if follow_symlinks {
            std::fs::metadata(entry.path())
        } else {
            entry.metadata()
        };
        let Ok(meta) = meta else { continue };
        out.push(DirEntry {
            name: entry.file_name(),
            path: entry.path(),
            info: FileInfo::from_metadata(&meta),
        });
    }
    Ok(out)
}

/// Walks the subtree rooted at `dir` in a single pass and groups entries by
/// parent directory, the same information a per-directory [`list_dir`] call
/// at every level of the tree would produce, used by the generic poller to
/// build a fresh [`DirSnapshot`] tree without one `read_dir` per directory.
/// `recursive` mirrors a watch's own recursive flag: when false the walk is
/// capped to the immediate children of `dir`.
pub fn list_tree_by_parent(
    dir: &Path,
    follow_symlinks: bool,
    recursive: bool,
) -> HashMap<PathBuf, Vec<DirEntry>> {
    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(follow_symlinks);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut by_parent: HashMap<PathBuf, Vec<DirEntry>> = HashMap::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let Some(parent) = entry.path().parent() else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        by_parent.entry(parent.to_path_buf()).or_default().push(DirEntry {
            name: entry.file_name().to_os_string(),
            path: entry.path().to_path_buf(),
            info: FileInfo::from_metadata(&meta),
        });
    }
    by_parent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_trailing_separator_is_idempotent() {
        let once = with_trailing_separator(Path::new("/tmp/foo"));
        assert!(once.ends_with(MAIN_SEPARATOR));
        let twice = with_trailing_separator(Path::new(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_root_absolutizes_relative_paths() {
        let normalized = normalize_root(Path::new("."));
        assert!(normalized.is_absolute());
    }

    #[test]
    fn normalize_root_leaves_absolute_paths_untouched() {
        let abs = Path::new("/tmp/some/dir");
        assert_eq!(normalize_root(abs), abs.to_path_buf());
    }

    #[test]
    fn split_separates_parent_from_name() {
        let (dir, name) = split(Path::new("/tmp/foo/bar.txt"));
        assert_eq!(dir, format!("/tmp/foo{}", MAIN_SEPARATOR));
        assert_eq!(name, "bar.txt");
    }

    #[test]
    fn list_dir_reports_children_and_directory_flag() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hi").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let mut entries = list_dir(tmp.path(), false).unwrap();
        entries.sort_by_key(|e| e.name.clone());

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert!(!entries[0].info.is_directory);
        assert_eq!(entries[1].name, "sub");
        assert!(entries[1].info.is_directory);
    }

    #[test]
    fn list_tree_by_parent_groups_nested_entries_by_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"hi").unwrap();
        std::fs::write(tmp.path().join("sub").join("nested.txt"), b"hi").unwrap();

        let by_parent = list_tree_by_parent(tmp.path(), false, true);
        let root_children = &by_parent[tmp.path()];
        assert_eq!(root_children.len(), 2);
        let sub_children = &by_parent[&tmp.path().join("sub")];
        assert_eq!(sub_children.len(), 1);
        assert_eq!(sub_children[0].name, "nested.txt");
    }

    #[test]
    fn list_tree_by_parent_non_recursive_stops_at_one_level() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("nested.txt"), b"hi").unwrap();

        let by_parent = list_tree_by_parent(tmp.path(), false, false);
        assert!(!by_parent.contains_key(&tmp.path().join("sub")));
    }
}
