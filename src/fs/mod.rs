//! Filesystem access seen by the validator and artifact plugins
//!
//! Every root a discovery run can end up with (an HFS+ volume, a single APFS
//! volume, the combined System/Data view, or a mounted directory) implements
//! [`FileSystem`]. Paths are absolute, `/`-separated and case-sensitive.

pub mod combined;
pub mod mounted;

pub use combined::{CombinedVolume, FirmlinkMap, DEFAULT_FIRMLINKS};
pub use mounted::MountedDirectory;

use serde::Serialize;

use crate::error::{DiscoveryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Result of a path lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsEntry {
    pub kind: EntryKind,
    pub size: u64,
}

impl FsEntry {
    pub fn file(size: u64) -> Self {
        Self { kind: EntryKind::File, size }
    }

    pub fn directory() -> Self {
        Self { kind: EntryKind::Directory, size: 0 }
    }
}

/// Path-resolving access to one filesystem root
pub trait FileSystem: Send {
    /// Short human-readable name used in logs
    fn describe(&self) -> String;

    /// Resolve `path`; `Ok(None)` when nothing exists there
    fn lookup(&self, path: &str) -> Result<Option<FsEntry>>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Names of the entries in directory `path`
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    fn exists(&self, path: &str) -> bool {
        matches!(self.lookup(path), Ok(Some(_)))
    }

    fn is_file(&self, path: &str) -> bool {
        matches!(self.lookup(path), Ok(Some(entry)) if entry.kind == EntryKind::File)
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.lookup(path), Ok(Some(entry)) if entry.kind == EntryKind::Directory)
    }
}

/// Canonical absolute form: leading `/`, no empty, `.` or trailing components
///
/// `..` pops the previous component and never climbs above the root.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

pub(crate) fn not_found(path: &str) -> DiscoveryError {
    DiscoveryError::Filesystem(format!("no such file or directory: {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("Users/alice/"), "/Users/alice");
        assert_eq!(normalize_path("//System/./Library//"), "/System/Library");
        assert_eq!(normalize_path("/usr/../../etc"), "/etc");
    }
}
