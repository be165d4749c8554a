// Already-mounted macOS root exposed through std::fs

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{normalize_path, not_found, EntryKind, FileSystem, FsEntry};
use crate::error::{DiscoveryError, Result};

pub struct MountedDirectory {
    root: PathBuf,
}

impl MountedDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(DiscoveryError::Filesystem(format!(
                "mount point is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let normalized = normalize_path(path);
        self.root.join(normalized.trim_start_matches('/'))
    }
}

impl FileSystem for MountedDirectory {
    fn describe(&self) -> String {
        format!("mounted {}", self.root.display())
    }

    fn lookup(&self, path: &str) -> Result<Option<FsEntry>> {
        match fs::symlink_metadata(self.host_path(path)) {
            Ok(meta) => {
                let kind = if meta.file_type().is_symlink() {
                    EntryKind::Symlink
                } else if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                Ok(Some(FsEntry { kind, size: meta.len() }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.host_path(path)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(path),
            _ => e.into(),
        })
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let dir = fs::read_dir(self.host_path(path)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(path),
            _ => DiscoveryError::from(e),
        })?;
        let mut names = Vec::new();
        for entry in dir {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mounted_lookup_and_read() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Users/bob")).unwrap();
        fs::write(temp.path().join("Users/bob/.zsh_history"), b"ls\n").unwrap();

        let mounted = MountedDirectory::new(temp.path()).unwrap();
        assert!(mounted.is_dir("/Users/bob"));
        assert_eq!(mounted.lookup("/Users/bob/.zsh_history").unwrap(), Some(FsEntry::file(3)));
        assert_eq!(mounted.read_file("Users/bob/.zsh_history").unwrap(), b"ls\n");
        assert_eq!(mounted.list_dir("/Users").unwrap(), vec!["bob".to_string()]);
        assert_eq!(mounted.lookup("/missing").unwrap(), None);
        assert!(mounted.read_file("/missing").is_err());
    }

    #[test]
    fn test_parent_components_stay_inside_root() {
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("root");
        fs::create_dir_all(&inner).unwrap();
        fs::write(temp.path().join("outside"), b"x").unwrap();

        let mounted = MountedDirectory::new(&inner).unwrap();
        assert!(!mounted.exists("/../outside"));
    }

    #[test]
    fn test_mount_point_must_exist() {
        assert!(MountedDirectory::new("/definitely/not/here").is_err());
    }
}
