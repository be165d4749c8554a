//! APFS container handling
//!
//! Block-level decoding (object maps, B-trees, keybags) is supplied by the
//! caller through [`ApfsDecoder`]. This module owns what sits above it:
//! classifying volumes by role, the per-container metadata cache and turning
//! a container into one validated filesystem root.
//!
//! ## Decoder contract
//!
//! - [`ApfsContainer::volumes`] reads only the container and volume
//!   superblocks; it is called on every run.
//! - [`ApfsContainer::index_volume`] and [`ApfsContainer::derive_key`] are
//!   the expensive steps and are skipped when the metadata cache is valid.
//!   Indexing writes its results into the [`VolumeCache`] it is given.
//! - [`ApfsContainer::open_volume`] mounts one volume, given its key when
//!   the volume is encrypted and decrypted on read, reloading the index
//!   from the same cache.

pub mod cache;
pub mod orchestrator;

pub use cache::{ensure_valid_cache, CacheRecord, CachedVolume, VolumeCache, CACHE_SCHEMA_VERSION};
pub use orchestrator::{ApfsOutcome, ApfsVolumeOrchestrator, RoleAssignment};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DiscoveryError, Result};
use crate::fs::FileSystem;
use crate::stream::ContainerStream;

// =============================================================================
// Volume Model
// =============================================================================

/// Declared purpose of an APFS volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeRole {
    System,
    Data,
    Preboot,
    Update,
    Other,
}

impl VolumeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeRole::System => "SYSTEM",
            VolumeRole::Data => "DATA",
            VolumeRole::Preboot => "PREBOOT",
            VolumeRole::Update => "UPDATE",
            VolumeRole::Other => "OTHER",
        }
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeRole {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SYSTEM" => Ok(VolumeRole::System),
            "DATA" => Ok(VolumeRole::Data),
            "PREBOOT" => Ok(VolumeRole::Preboot),
            "UPDATE" => Ok(VolumeRole::Update),
            "OTHER" => Ok(VolumeRole::Other),
            other => Err(DiscoveryError::CacheInvalid(format!("unknown volume role '{}'", other))),
        }
    }
}

/// One volume of a container, as listed by its superblock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub name: String,
    pub role: VolumeRole,
    pub encrypted: bool,
    /// Volume UUID
    pub identifier: Uuid,
    /// Position in the container's volume list
    pub index: u32,
    pub used_block_count: u64,
    pub block_size: u32,
    /// Metadata cache holding this volume's index, once one is attached
    #[serde(default)]
    pub backing_database: Option<PathBuf>,
}

impl VolumeHandle {
    pub fn used_bytes(&self) -> u64 {
        self.used_block_count.saturating_mul(self.block_size as u64)
    }

    pub fn with_backing_database(mut self, cache_path: &Path) -> Self {
        self.backing_database = Some(cache_path.to_path_buf());
        self
    }
}

/// A confirmed APFS container inside an evidence image
#[derive(Debug, Clone, Serialize)]
pub struct ApfsContainerHandle {
    pub start_offset: u64,
    pub byte_length: u64,
    pub uuid: Uuid,
    pub volumes: Vec<VolumeHandle>,
}

impl ApfsContainerHandle {
    /// `APFS_Volumes_<UUID>.db`, the cache file name for this container
    pub fn cache_file_name(&self) -> String {
        cache::cache_file_name(&self.uuid)
    }

    pub fn volume_with_role(&self, role: VolumeRole) -> Option<&VolumeHandle> {
        self.volumes.iter().find(|v| v.role == role)
    }
}

// =============================================================================
// Credentials & Keys
// =============================================================================

/// Secret used to unlock encrypted volumes
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    /// Personal recovery key, `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX`
    RecoveryKey(String),
}

impl Credential {
    /// Classify a user-supplied secret
    pub fn from_secret(secret: &str) -> Self {
        static RECOVERY_KEY: OnceLock<Regex> = OnceLock::new();
        let re = RECOVERY_KEY.get_or_init(|| {
            Regex::new(r"^[A-Z0-9]{4}(-[A-Z0-9]{4}){5}$").expect("recovery key pattern is valid")
        });
        let trimmed = secret.trim();
        if re.is_match(&trimmed.to_uppercase()) {
            Credential::RecoveryKey(trimmed.to_uppercase())
        } else {
            Credential::Password(secret.to_string())
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credential::Password(s) | Credential::RecoveryKey(s) => s,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::RecoveryKey(_) => f.write_str("RecoveryKey(***)"),
        }
    }
}

/// Unwrapped volume encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        hex::decode(text)
            .map(Self)
            .map_err(|e| DiscoveryError::CacheInvalid(format!("bad key material: {}", e)))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

// =============================================================================
// Decoder Interfaces
// =============================================================================

/// Opens APFS containers found inside a stream
pub trait ApfsDecoder: Send + Sync {
    fn open(&self, stream: Arc<ContainerStream>, offset: u64, length: u64) -> Result<Box<dyn ApfsContainer>>;
}

/// An opened APFS container
pub trait ApfsContainer: Send {
    /// Volumes from the superblocks, in container order
    fn volumes(&self) -> Result<Vec<VolumeHandle>>;

    /// Build the volume's index into `cache`; returns the number of records indexed
    fn index_volume(&mut self, volume: &VolumeHandle, key: Option<&KeyMaterial>, cache: &VolumeCache) -> Result<u64>;

    /// Unwrap the volume key with `credential`
    ///
    /// A wrong credential is a `Decryption` error; anything else (an
    /// unreadable keybag) is reported as it is.
    fn derive_key(&mut self, volume: &VolumeHandle, credential: &Credential) -> Result<KeyMaterial>;

    /// Mount a volume whose index is already in `cache`
    fn open_volume(
        &mut self,
        volume: &VolumeHandle,
        key: Option<&KeyMaterial>,
        cache: &VolumeCache,
    ) -> Result<Box<dyn FileSystem>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_classification() {
        assert!(matches!(
            Credential::from_secret("abcd-efgh-ijkl-mnop-qrst-uvwx"),
            Credential::RecoveryKey(ref k) if k == "ABCD-EFGH-IJKL-MNOP-QRST-UVWX"
        ));
        assert!(matches!(Credential::from_secret("hunter2"), Credential::Password(_)));
        assert_eq!(format!("{:?}", Credential::from_secret("hunter2")), "Password(***)");
    }

    #[test]
    fn test_role_round_trip_text() {
        for role in [VolumeRole::System, VolumeRole::Data, VolumeRole::Preboot, VolumeRole::Update, VolumeRole::Other] {
            assert_eq!(role.as_str().parse::<VolumeRole>().unwrap(), role);
        }
        assert!("RECOVERY".parse::<VolumeRole>().is_err());
    }

    #[test]
    fn test_key_material_hex() {
        let key = KeyMaterial::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(key.to_hex(), "deadbeef");
        assert_eq!(KeyMaterial::from_hex("deadbeef").unwrap(), key);
        assert!(KeyMaterial::from_hex("zz").is_err());
    }
}
