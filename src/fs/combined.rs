//! Combined System + Data view of a split macOS 10.15+ APFS layout
//!
//! The system volume is read-only and carries the OS; user data lives on the
//! data volume and is grafted into the system namespace through firmlinks.
//! [`CombinedVolume`] resolves a path against the firmlink table: paths at or
//! below a firmlinked directory are read from the data volume, everything
//! else from the system volume. `/System/Volumes/Data/<rest>` always maps to
//! `<rest>` on the data volume.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{normalize_path, FileSystem, FsEntry};
use crate::error::Result;

/// Firmlink table shipped in `/usr/share/firmlinks` on macOS 10.15+
pub const DEFAULT_FIRMLINKS: &[&str] = &[
    "/AppleInternal",
    "/Applications",
    "/Library",
    "/System/Library/Caches",
    "/System/Library/Assets",
    "/System/Library/PreinstalledAssets",
    "/System/Library/AssetsV2",
    "/System/Library/PreinstalledAssetsV2",
    "/System/Library/CoreServices/CoreTypes.bundle/Contents/Library",
    "/System/Library/Speech",
    "/Users",
    "/Volumes",
    "/cores",
    "/opt",
    "/private",
    "/usr/local",
    "/usr/libexec/cups",
    "/usr/share/snmp",
];

/// Location of the firmlink table on the system volume
pub const FIRMLINKS_FILE: &str = "/usr/share/firmlinks";

const DATA_MOUNT_PREFIX: &str = "/System/Volumes/Data";

/// One system-path to data-path redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmlink {
    /// Absolute path in the system namespace
    pub source: String,
    /// Path relative to the data volume root
    pub target: String,
}

impl Firmlink {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: normalize_path(source),
            target: normalize_path(target),
        }
    }

    /// Firmlink whose data-side path mirrors its system-side path
    pub fn mirrored(source: &str) -> Self {
        Self::new(source, source)
    }
}

/// Redirect table, matched by longest prefix on component boundaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmlinkMap {
    entries: Vec<Firmlink>,
}

impl Default for FirmlinkMap {
    fn default() -> Self {
        Self::from_paths(DEFAULT_FIRMLINKS.iter().copied())
    }
}

impl FirmlinkMap {
    pub fn new(entries: Vec<Firmlink>) -> Self {
        let mut map = Self { entries: Vec::new() };
        for entry in entries {
            map.insert(entry);
        }
        map
    }

    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(paths.into_iter().map(Firmlink::mirrored).collect())
    }

    /// Parse the `/usr/share/firmlinks` format: `<system path>\t<data path>`
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut fields = line.split('\t').filter(|f| !f.is_empty());
                match (fields.next(), fields.next()) {
                    (Some(source), Some(target)) => Some(Firmlink::new(source, target)),
                    _ => {
                        trace!(line, "Ignoring malformed firmlink line");
                        None
                    }
                }
            })
            .collect();
        Self::new(entries)
    }

    /// Add `entry`, replacing any redirect with the same source
    pub fn insert(&mut self, entry: Firmlink) {
        self.entries.retain(|existing| existing.source != entry.source);
        self.entries.push(entry);
        self.entries.sort_by(|a, b| b.source.len().cmp(&a.source.len()).then(a.source.cmp(&b.source)));
    }

    pub fn merge(&mut self, other: FirmlinkMap) {
        for entry in other.entries {
            self.insert(entry);
        }
    }

    pub fn entries(&self) -> &[Firmlink] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Data-volume path for `path`, or `None` when it stays on the system volume
    pub fn resolve(&self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        if let Some(rest) = strip_component_prefix(&path, DATA_MOUNT_PREFIX) {
            return Some(normalize_path(rest));
        }
        self.entries.iter().find_map(|link| {
            strip_component_prefix(&path, &link.source).map(|rest| normalize_path(&format!("{}/{}", link.target, rest)))
        })
    }
}

/// `path` with `prefix` removed, only when `prefix` ends on a component boundary
fn strip_component_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// One logical root over a SYSTEM and DATA volume pair
pub struct CombinedVolume {
    system: Box<dyn FileSystem>,
    data: Box<dyn FileSystem>,
    firmlinks: FirmlinkMap,
}

impl CombinedVolume {
    /// Build the view, merging the system volume's own firmlink table into `firmlinks`
    pub fn new(system: Box<dyn FileSystem>, data: Box<dyn FileSystem>, mut firmlinks: FirmlinkMap) -> Self {
        match system.read_file(FIRMLINKS_FILE) {
            Ok(bytes) => {
                let on_disk = FirmlinkMap::parse(&String::from_utf8_lossy(&bytes));
                debug!(entries = on_disk.len(), "Merging firmlinks from system volume");
                firmlinks.merge(on_disk);
            }
            Err(e) => trace!("No firmlink table on system volume: {}", e),
        }
        if firmlinks.is_empty() {
            warn!("Combined volume has no firmlinks; data volume is only reachable under {}", DATA_MOUNT_PREFIX);
        }
        Self { system, data, firmlinks }
    }

    pub fn firmlinks(&self) -> &FirmlinkMap {
        &self.firmlinks
    }

    fn route(&self, path: &str) -> (&dyn FileSystem, String) {
        match self.firmlinks.resolve(path) {
            Some(data_path) => (self.data.as_ref(), data_path),
            None => (self.system.as_ref(), normalize_path(path)),
        }
    }
}

impl FileSystem for CombinedVolume {
    fn describe(&self) -> String {
        format!("combined({} + {})", self.system.describe(), self.data.describe())
    }

    fn lookup(&self, path: &str) -> Result<Option<FsEntry>> {
        let (fs, resolved) = self.route(path);
        fs.lookup(&resolved)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let (fs, resolved) = self.route(path);
        fs.read_file(&resolved)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let (fs, resolved) = self.route(path);
        let mut names: BTreeSet<String> = fs.list_dir(&resolved)?.into_iter().collect();

        // Firmlinked children of a system directory show up even when the
        // system volume holds no placeholder for them.
        if self.firmlinks.resolve(path).is_none() {
            let parent = normalize_path(path);
            for link in self.firmlinks.entries() {
                let rest = if parent == "/" {
                    Some(link.source.as_str())
                } else {
                    strip_component_prefix(&link.source, &parent)
                };
                let Some(child) = rest.map(|r| r.trim_start_matches('/')) else {
                    continue;
                };
                if child.is_empty() || child.contains('/') {
                    continue;
                }
                if self.data.exists(&link.target) {
                    names.insert(child.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryFs;

    fn volumes() -> (MemoryFs, MemoryFs) {
        let system = MemoryFs::new("System")
            .with_file("/System/Library/CoreServices/SystemVersion.plist", b"system")
            .with_file("/Library/Preferences/only-on-system", b"stale")
            .with_dir("/Users");
        let data = MemoryFs::new("Data")
            .with_file("/Users/alice/Documents/notes.txt", b"hello")
            .with_file("/Library/Preferences/com.apple.loginwindow.plist", b"prefs")
            .with_file("/private/var/db/.AppleSetupDone", b"");
        (system, data)
    }

    #[test]
    fn test_resolve_longest_prefix_on_component_boundary() {
        let map = FirmlinkMap::default();
        assert_eq!(map.resolve("/Users/alice").as_deref(), Some("/Users/alice"));
        assert_eq!(map.resolve("/UsersX/alice"), None);
        assert_eq!(map.resolve("/usr/local/bin/brew").as_deref(), Some("/usr/local/bin/brew"));
        assert_eq!(map.resolve("/usr/bin/true"), None);
        assert_eq!(map.resolve("/System/Library/Caches/x").as_deref(), Some("/System/Library/Caches/x"));
        assert_eq!(map.resolve("/System/Library/Kernels/kernel"), None);
        assert_eq!(map.resolve("/System/Volumes/Data/Users").as_deref(), Some("/Users"));
    }

    #[test]
    fn test_parse_firmlinks_file() {
        let map = FirmlinkMap::parse("/Applications\tApplications\n/Users\tUsers\n\nbroken-line\n");
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve("/Applications/Safari.app").as_deref(), Some("/Applications/Safari.app"));
    }

    #[test]
    fn test_combined_routes_by_firmlink() {
        let (system, data) = volumes();
        let combined = CombinedVolume::new(Box::new(system), Box::new(data), FirmlinkMap::default());

        assert_eq!(combined.read_file("/Users/alice/Documents/notes.txt").unwrap(), b"hello");
        assert_eq!(combined.read_file("/System/Library/CoreServices/SystemVersion.plist").unwrap(), b"system");
        assert!(combined.exists("/Library/Preferences/com.apple.loginwindow.plist"));
        assert!(!combined.exists("/Library/Preferences/only-on-system"));
        assert!(combined.is_dir("/System/Volumes/Data/Users/alice"));
    }

    #[test]
    fn test_configured_redirects_only() {
        let (system, data) = volumes();
        let combined = CombinedVolume::new(Box::new(system), Box::new(data), FirmlinkMap::from_paths(["/Users"]));
        assert!(combined.exists("/Users/alice"));
        assert!(combined.exists("/Library/Preferences/only-on-system"));
    }

    #[test]
    fn test_system_firmlink_file_is_merged() {
        let (system, data) = volumes();
        let system = system.with_file(FIRMLINKS_FILE, b"/Users\tUsers\n/Library\tLibrary\n");
        let combined = CombinedVolume::new(Box::new(system), Box::new(data), FirmlinkMap::new(Vec::new()));
        assert!(combined.exists("/Library/Preferences/com.apple.loginwindow.plist"));
        assert_eq!(combined.firmlinks().len(), 2);
    }

    #[test]
    fn test_root_listing_includes_firmlinked_dirs() {
        let (system, data) = volumes();
        let combined = CombinedVolume::new(Box::new(system), Box::new(data), FirmlinkMap::default());
        let root = combined.list_dir("/").unwrap();
        assert!(root.contains(&"System".to_string()));
        assert!(root.contains(&"Users".to_string()));
        assert!(root.contains(&"private".to_string()));
        assert!(!root.contains(&"opt".to_string()));
        assert_eq!(combined.list_dir("/Users").unwrap(), vec!["alice".to_string()]);
    }
}
