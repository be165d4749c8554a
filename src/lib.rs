//! macOS installation discovery for forensic evidence containers
//!
//! Opens an evidence container (raw/split raw, DMG, E01, AFF4, sparse image,
//! VMDK), finds the partition or APFS container holding macOS, unlocks and
//! combines APFS volumes as needed, and hands a validated
//! [`MacOsInstallation`] to artifact plugins.
//!
//! ```rust,ignore
//! let stream = Arc::new(ContainerStream::open(ContainerFormat::E01, path, &registry)?);
//! let mut controller = DiscoveryController::new(stream, &apfs_decoder, &hfs_decoder, options);
//! let installation = controller.run()?;
//! run_plugins(&installation, &mut plugins);
//! ```

pub mod apfs;
pub mod common;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod fs;
pub mod hfs;
pub mod logging;
pub mod partition;
pub mod signature;
pub mod stream;
pub mod validator;

#[cfg(test)]
mod testing;

pub use apfs::{ApfsContainer, ApfsDecoder, Credential, KeyMaterial, VolumeHandle, VolumeRole};
pub use config::DiscoveryConfig;
pub use context::{DiscoveryPath, MacFilesystem, MacOsInstallation};
pub use discovery::{discover_mounted, run_plugins, ArtifactPlugin, DiscoveryController, DiscoveryOptions};
pub use error::{DiscoveryError, Result};
pub use fs::FileSystem;
pub use hfs::HfsDecoder;
pub use stream::{ContainerDecoder, ContainerFormat, ContainerStream, DecoderFactory, DecoderRegistry};
