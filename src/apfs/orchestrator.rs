//! From a detected APFS container to one validated filesystem root
//!
//! Steps, in order:
//! 1. list volumes from the superblocks and open the metadata cache
//!    (reused only when it matches the live volume set);
//! 2. classify volumes by role;
//! 3. on a cache miss, derive keys for encrypted volumes, index every
//!    volume into the cache and persist the new record; on a hit, take keys
//!    and index state from the cache;
//! 4. SYSTEM present: require DATA and validate the combined view.
//!    No SYSTEM: validate volumes in container order, first one wins.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::cache::{ensure_valid_cache, CacheRecord, CachedVolume, VolumeCache};
use super::{ApfsContainer, ApfsContainerHandle, ApfsDecoder, Credential, KeyMaterial, VolumeHandle, VolumeRole};
use crate::context::MacFilesystem;
use crate::error::{DiscoveryError, Result};
use crate::fs::{CombinedVolume, FileSystem, FirmlinkMap};
use crate::logging;
use crate::stream::ContainerStream;
use crate::validator::{self, ValidationReport};

/// Volumes picked out of a container by role
#[derive(Debug, Clone, Default)]
pub struct RoleAssignment {
    pub system: Option<VolumeHandle>,
    pub data: Option<VolumeHandle>,
    pub preboot: Option<VolumeHandle>,
    pub update: Option<VolumeHandle>,
}

impl RoleAssignment {
    /// First volume of each role wins; later duplicates are ignored
    pub fn classify(volumes: &[VolumeHandle]) -> Self {
        let mut roles = Self::default();
        for volume in volumes {
            let slot = match volume.role {
                VolumeRole::System => &mut roles.system,
                VolumeRole::Data => &mut roles.data,
                VolumeRole::Preboot => &mut roles.preboot,
                VolumeRole::Update => &mut roles.update,
                VolumeRole::Other => continue,
            };
            match slot {
                Some(existing) => warn!(
                    role = %volume.role,
                    kept = %existing.name,
                    ignored = %volume.name,
                    "Container has more than one volume with this role"
                ),
                None => *slot = Some(volume.clone()),
            }
        }
        roles
    }
}

/// A container that yielded a validated macOS root
pub struct ApfsOutcome {
    pub container: ApfsContainerHandle,
    pub filesystem: MacFilesystem,
    pub report: ValidationReport,
    /// Volume whose root validated (the SYSTEM volume for split layouts)
    pub root_volume: VolumeHandle,
    pub roles: RoleAssignment,
    pub cache: VolumeCache,
}

/// Per-volume state gathered before any volume is opened
struct PreparedVolume {
    handle: VolumeHandle,
    key: Option<KeyMaterial>,
    /// Why the volume could not be unlocked
    key_error: Option<String>,
    indexed_records: u64,
}

impl PreparedVolume {
    fn to_cached(&self) -> CachedVolume {
        CachedVolume::from_handle(&self.handle, self.key.clone(), self.indexed_records)
    }
}

pub struct ApfsVolumeOrchestrator<'a> {
    decoder: &'a dyn ApfsDecoder,
    output_dir: &'a Path,
    credential: Option<&'a Credential>,
    decrypt_on_read: bool,
    firmlinks: &'a FirmlinkMap,
}

impl<'a> ApfsVolumeOrchestrator<'a> {
    pub fn new(
        decoder: &'a dyn ApfsDecoder,
        output_dir: &'a Path,
        credential: Option<&'a Credential>,
        decrypt_on_read: bool,
        firmlinks: &'a FirmlinkMap,
    ) -> Self {
        Self {
            decoder,
            output_dir,
            credential,
            decrypt_on_read,
            firmlinks,
        }
    }

    /// Find a macOS root inside the container at `offset`
    ///
    /// `Ok(None)` means the container was readable but holds no macOS
    /// installation.
    #[instrument(skip(self, stream))]
    pub fn process(
        &self,
        stream: Arc<ContainerStream>,
        offset: u64,
        length: u64,
        uuid: Uuid,
    ) -> Result<Option<ApfsOutcome>> {
        let mut container = self.decoder.open(stream, offset, length)?;
        let live = container.volumes()?;
        info!(%uuid, volumes = live.len(), "Opened APFS container");
        if logging::is_debug_enabled() {
            for volume in &live {
                debug!(
                    index = volume.index,
                    name = %volume.name,
                    role = %volume.role,
                    encrypted = volume.encrypted,
                    used_bytes = volume.used_bytes(),
                    "APFS volume"
                );
            }
        }

        let mut cache = ensure_valid_cache(self.output_dir, &uuid, &live, self.decrypt_on_read)?;
        let live: Vec<VolumeHandle> = live
            .into_iter()
            .map(|volume| volume.with_backing_database(cache.path()))
            .collect();
        let handle = ApfsContainerHandle {
            start_offset: offset,
            byte_length: length,
            uuid,
            volumes: live.clone(),
        };
        let roles = RoleAssignment::classify(&live);

        let prepared = match cache.record() {
            Some(record) => self.prepare_from_cache(&live, record),
            None => {
                let prepared = self.prepare_live(container.as_mut(), &live, &cache)?;
                let record = CacheRecord::new(uuid, prepared.iter().map(PreparedVolume::to_cached).collect());
                cache.write_record(&record)?;
                prepared
            }
        };

        let found = match &roles.system {
            Some(system) => {
                let data = roles.data.as_ref().ok_or_else(|| DiscoveryError::MissingComplementVolume {
                    system: system.name.clone(),
                })?;
                self.open_combined(container.as_mut(), &prepared, &cache, system, data)?
            }
            None => self.find_single_root(container.as_mut(), &prepared, &cache)?,
        };

        let Some((filesystem, report, root_volume)) = found else {
            info!(%uuid, "No macOS installation in APFS container");
            return Ok(None);
        };

        Ok(Some(ApfsOutcome {
            container: handle,
            filesystem,
            report,
            root_volume,
            roles,
            cache,
        }))
    }

    fn prepare_from_cache(&self, live: &[VolumeHandle], record: &CacheRecord) -> Vec<PreparedVolume> {
        debug!("Taking volume keys and index state from cache");
        live.iter()
            .map(|volume| {
                let cached = record.volume(&volume.identifier);
                PreparedVolume {
                    handle: volume.clone(),
                    key: cached.and_then(|c| c.key_material.clone()),
                    key_error: None,
                    indexed_records: cached.map_or(0, |c| c.indexed_records),
                }
            })
            .collect()
    }

    fn prepare_live(
        &self,
        container: &mut dyn ApfsContainer,
        live: &[VolumeHandle],
        cache: &VolumeCache,
    ) -> Result<Vec<PreparedVolume>> {
        let mut prepared = Vec::with_capacity(live.len());
        for volume in live {
            let (key, key_error) = if volume.encrypted && self.decrypt_on_read {
                match self.credential {
                    Some(credential) => match container.derive_key(volume, credential) {
                        Ok(key) => (Some(key), None),
                        Err(DiscoveryError::Decryption { reason, .. }) => (None, Some(reason)),
                        Err(e) => return Err(e),
                    },
                    None => (
                        None,
                        Some("volume is encrypted and no password or recovery key was supplied".to_string()),
                    ),
                }
            } else {
                (None, None)
            };

            let indexed_records = match &key_error {
                Some(reason) => {
                    warn!(volume = %volume.name, "Cannot unlock volume: {}", reason);
                    0
                }
                None => {
                    let count = container.index_volume(volume, key.as_ref(), cache)?;
                    debug!(volume = %volume.name, records = count, "Indexed volume");
                    count
                }
            };

            prepared.push(PreparedVolume {
                handle: volume.clone(),
                key,
                key_error,
                indexed_records,
            });
        }
        Ok(prepared)
    }

    fn open_prepared(
        &self,
        container: &mut dyn ApfsContainer,
        prepared: &[PreparedVolume],
        cache: &VolumeCache,
        volume: &VolumeHandle,
    ) -> Result<Box<dyn FileSystem>> {
        let entry = prepared
            .iter()
            .find(|p| p.handle.identifier == volume.identifier)
            .ok_or_else(|| DiscoveryError::Filesystem(format!("volume {} vanished", volume.name)))?;
        if let Some(reason) = &entry.key_error {
            return Err(DiscoveryError::Decryption {
                volume: volume.name.clone(),
                reason: reason.clone(),
            });
        }
        container.open_volume(&entry.handle, entry.key.as_ref(), cache)
    }

    fn open_combined(
        &self,
        container: &mut dyn ApfsContainer,
        prepared: &[PreparedVolume],
        cache: &VolumeCache,
        system: &VolumeHandle,
        data: &VolumeHandle,
    ) -> Result<Option<(MacFilesystem, ValidationReport, VolumeHandle)>> {
        info!(system = %system.name, data = %data.name, "Split System/Data layout");
        let system_fs = self.open_prepared(container, prepared, cache, system)?;
        let data_fs = self.open_prepared(container, prepared, cache, data)?;
        let combined = MacFilesystem::Combined(CombinedVolume::new(system_fs, data_fs, self.firmlinks.clone()));

        Ok(validator::validate(&combined)?.map(|report| (combined, report, system.clone())))
    }

    fn find_single_root(
        &self,
        container: &mut dyn ApfsContainer,
        prepared: &[PreparedVolume],
        cache: &VolumeCache,
    ) -> Result<Option<(MacFilesystem, ValidationReport, VolumeHandle)>> {
        let mut decryption_failure = None;

        for entry in prepared {
            let volume = &entry.handle;
            let fs = match self.open_prepared(container, prepared, cache, volume) {
                Ok(fs) => MacFilesystem::ApfsVolume(fs),
                Err(e @ DiscoveryError::Decryption { .. }) => {
                    decryption_failure = Some(e);
                    continue;
                }
                Err(e) => {
                    warn!(volume = %volume.name, "Failed to open volume: {}", e);
                    continue;
                }
            };
            match validator::validate(&fs) {
                Ok(Some(report)) => {
                    info!(volume = %volume.name, "macOS root found on single volume");
                    return Ok(Some((fs, report, volume.clone())));
                }
                Ok(None) => debug!(volume = %volume.name, "Volume is not a macOS root"),
                Err(e) => warn!(volume = %volume.name, "Validation failed: {}", e),
            }
        }

        match decryption_failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}
