//! Error types for evidence access and macOS discovery

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised while opening evidence and searching it for macOS
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Backing resource could not be opened or read
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Range read that the backing resource cannot satisfy
    #[error("Read of {length} bytes at offset {offset} failed: {reason}")]
    Read {
        offset: u64,
        length: usize,
        reason: String,
    },

    /// Stream used after `close()`
    #[error("Container stream was already closed")]
    ClosedStream,

    /// Multi-file container with missing constituent files
    #[error("Incomplete container {}: {reason}", .path.display())]
    IncompleteContainer { path: PathBuf, reason: String },

    /// No decoder available for the requested container format
    #[error("Unsupported container format: {0}")]
    UnsupportedFormat(String),

    /// Neither GPT nor APM could be read from the image
    #[error("No partition table found")]
    NoPartitionTable,

    /// Stale or mismatched cache; always recovered by rebuilding
    #[error("APFS volume cache is stale: {0}")]
    CacheInvalid(String),

    /// Cache database error
    #[error("Cache database error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// Cache file could not be created, replaced or written
    #[error("Cannot set up metadata cache {}: {reason}", .path.display())]
    CacheSetup { path: PathBuf, reason: String },

    /// Cache file already opened by another orchestrator
    #[error("Cache {} is already in use", .0.display())]
    CacheBusy(PathBuf),

    /// Missing or wrong credential for an encrypted volume
    #[error("Failed to decrypt volume '{volume}': {reason}")]
    Decryption { volume: String, reason: String },

    /// SYSTEM volume present without its DATA complement
    #[error("Found system volume '{system}' but no data volume")]
    MissingComplementVolume { system: String },

    /// Every candidate was exhausted
    #[error("Could not find a partition having a macOS installation on it")]
    NoMacOsFound,

    /// Filesystem collaborator failure (lookup, read)
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Invalid configuration or credentials file
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    pub(crate) fn read(offset: u64, length: usize, reason: impl Into<String>) -> Self {
        DiscoveryError::Read {
            offset,
            length,
            reason: reason.into(),
        }
    }

    /// True for failures that only disqualify the current candidate
    pub fn is_candidate_local(&self) -> bool {
        !matches!(
            self,
            DiscoveryError::ClosedStream | DiscoveryError::Config(_) | DiscoveryError::CacheSetup { .. }
        )
    }
}
