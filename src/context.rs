//! The validated installation handed to artifact plugins

use std::path::PathBuf;

use serde::Serialize;

use crate::apfs::{ApfsContainerHandle, Credential, RoleAssignment, VolumeCache, VolumeHandle};
use crate::error::Result;
use crate::fs::{CombinedVolume, FileSystem, FsEntry, MountedDirectory};
use crate::validator::{SystemInfo, ValidationReport};

/// Root filesystem of a discovered installation
pub enum MacFilesystem {
    Hfs(Box<dyn FileSystem>),
    ApfsVolume(Box<dyn FileSystem>),
    Combined(CombinedVolume),
    Mounted(MountedDirectory),
}

impl MacFilesystem {
    pub fn kind(&self) -> &'static str {
        match self {
            MacFilesystem::Hfs(_) => "HFS+",
            MacFilesystem::ApfsVolume(_) => "APFS",
            MacFilesystem::Combined(_) => "APFS System+Data",
            MacFilesystem::Mounted(_) => "mounted",
        }
    }

    fn inner(&self) -> &dyn FileSystem {
        match self {
            MacFilesystem::Hfs(fs) | MacFilesystem::ApfsVolume(fs) => fs.as_ref(),
            MacFilesystem::Combined(fs) => fs,
            MacFilesystem::Mounted(fs) => fs,
        }
    }
}

impl FileSystem for MacFilesystem {
    fn describe(&self) -> String {
        self.inner().describe()
    }

    fn lookup(&self, path: &str) -> Result<Option<FsEntry>> {
        self.inner().lookup(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner().read_file(path)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        self.inner().list_dir(path)
    }
}

/// Where the installation was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryPath {
    WholeImageApfs,
    WholeImageHfs,
    Partition,
    Mounted,
}

/// Everything known about one confirmed macOS installation
///
/// Built per candidate and only kept once the candidate validated.
pub struct MacOsInstallation {
    pub filesystem: MacFilesystem,
    pub found_via: DiscoveryPath,
    pub credential: Option<Credential>,
    pub decrypt_on_read: bool,
    /// Byte offset of the partition (or container) holding the root
    pub partition_start_offset: u64,
    pub is_apfs: bool,
    pub container: Option<ApfsContainerHandle>,
    /// Volume whose root validated, for APFS
    pub root_volume: Option<VolumeHandle>,
    pub system_volume: Option<VolumeHandle>,
    pub data_volume: Option<VolumeHandle>,
    pub preboot_volume: Option<VolumeHandle>,
    pub update_volume: Option<VolumeHandle>,
    pub cache: Option<VolumeCache>,
    pub system_info: Option<SystemInfo>,
    pub kernel_path: Option<String>,
    pub users: Vec<String>,
}

impl MacOsInstallation {
    pub(crate) fn new(
        filesystem: MacFilesystem,
        found_via: DiscoveryPath,
        partition_start_offset: u64,
        report: ValidationReport,
    ) -> Self {
        Self {
            filesystem,
            found_via,
            credential: None,
            decrypt_on_read: true,
            partition_start_offset,
            is_apfs: false,
            container: None,
            root_volume: None,
            system_volume: None,
            data_volume: None,
            preboot_volume: None,
            update_volume: None,
            cache: None,
            system_info: report.system_info,
            kernel_path: report.kernel_path,
            users: report.users,
        }
    }

    pub(crate) fn with_credentials(mut self, credential: Option<Credential>, decrypt_on_read: bool) -> Self {
        self.credential = credential;
        self.decrypt_on_read = decrypt_on_read;
        self
    }

    pub(crate) fn with_apfs(
        mut self,
        container: ApfsContainerHandle,
        root_volume: VolumeHandle,
        roles: RoleAssignment,
        cache: VolumeCache,
    ) -> Self {
        self.is_apfs = true;
        self.container = Some(container);
        self.root_volume = Some(root_volume);
        self.system_volume = roles.system;
        self.data_volume = roles.data;
        self.preboot_volume = roles.preboot;
        self.update_volume = roles.update;
        self.cache = Some(cache);
        self
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache.as_ref().map(|c| c.path().to_path_buf())
    }

    pub fn product_version(&self) -> Option<&str> {
        self.system_info.as_ref()?.product_version.as_deref()
    }

    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        let version = self.product_version().unwrap_or("unknown version");
        let build = self
            .system_info
            .as_ref()
            .and_then(|s| s.build_version.as_deref())
            .unwrap_or("unknown build");
        format!(
            "macOS {} ({}) on {} at offset {}, {} user(s)",
            version,
            build,
            self.filesystem.kind(),
            self.partition_start_offset,
            self.users.len()
        )
    }
}

impl std::fmt::Debug for MacOsInstallation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacOsInstallation")
            .field("filesystem", &self.filesystem.describe())
            .field("found_via", &self.found_via)
            .field("partition_start_offset", &self.partition_start_offset)
            .field("is_apfs", &self.is_apfs)
            .field("system_info", &self.system_info)
            .field("users", &self.users)
            .finish()
    }
}
