//! Discovery configuration
//!
//! Stored as pretty JSON (`config.json`), by default under the user's local
//! data directory. Every field has a default so an empty object is a valid
//! file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::apfs::Credential;
use crate::common::DEFAULT_MAX_OPEN_FILES;
use crate::discovery::DiscoveryOptions;
use crate::error::{DiscoveryError, Result};
use crate::fs::combined::{Firmlink, DEFAULT_FIRMLINKS};
use crate::fs::FirmlinkMap;

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Application version (from Cargo.toml)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIG_DIR_NAME: &str = "mac-discover";
const CONFIG_FILE_NAME: &str = "config.json";

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

fn default_firmlinks() -> Vec<Firmlink> {
    DEFAULT_FIRMLINKS.iter().map(|p| Firmlink::mirrored(p)).collect()
}

fn default_max_open_files() -> usize {
    DEFAULT_MAX_OPEN_FILES
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Config file format version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Where metadata caches are written; current directory when unset
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// False when the evidence was imaged after the volume was unlocked
    #[serde(default = "default_true")]
    pub decrypt_on_read: bool,
    /// Paths of the combined System/Data view served by the data volume
    #[serde(default = "default_firmlinks")]
    pub firmlinks: Vec<Firmlink>,
    /// Cap on simultaneously open segment files
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            output_path: None,
            decrypt_on_read: true,
            firmlinks: default_firmlinks(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl DiscoveryConfig {
    /// `<data_local_dir>/mac-discover/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let json = fs::read_to_string(path)
            .map_err(|e| DiscoveryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| DiscoveryError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        if config.version > CONFIG_VERSION {
            warn!(
                "Config file version {} is newer than supported version {}",
                config.version, CONFIG_VERSION
            );
        }
        Ok(config)
    }

    /// Explicit path, else the default location when it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => {
                debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DiscoveryError::Config(format!("cannot serialize configuration: {}", e)))?;
        fs::write(path, &json)?;
        info!("Configuration saved: {} ({} bytes)", path.display(), json.len());
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_path.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn firmlink_map(&self) -> FirmlinkMap {
        FirmlinkMap::new(self.firmlinks.clone())
    }

    pub fn to_options(&self, credential: Option<Credential>) -> DiscoveryOptions {
        DiscoveryOptions {
            output_dir: self.output_dir(),
            credential,
            decrypt_on_read: self.decrypt_on_read,
            firmlinks: self.firmlink_map(),
        }
    }
}

/// First line of a password file, without its line ending
pub fn read_password_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| DiscoveryError::Config(format!("cannot read password file {}: {}", path.display(), e)))?;
    let first = contents.split('\n').next().unwrap_or_default().trim_end_matches('\r');
    if first.is_empty() {
        return Err(DiscoveryError::Config(format!("password file {} is empty", path.display())));
    }
    Ok(first.to_string())
}
