//! Uniform random-access byte source over evidence containers
//!
//! Every backing format (raw/split raw, DMG, E01, AFF4, Apple sparse image,
//! VMDK) is presented as a [`ContainerStream`] exposing the same three
//! operations: `read(offset, length)`, `size()` and `close()`.
//!
//! Formats whose byte layout is plain concatenation (raw, split raw,
//! uncompressed DMG, flat VMDK extents) are decoded here. Compressed or
//! encoded formats are opened through a [`DecoderRegistry`] of
//! caller-supplied [`DecoderFactory`] implementations, which receive the
//! already-located constituent file list.
//!
//! ```rust,ignore
//! let registry = DecoderRegistry::default();
//! let stream = ContainerStream::open(ContainerFormat::Raw, Path::new("mac.001"), &registry)?;
//! let boot = stream.read(0, 512)?;
//! stream.close()?;
//! ```

mod memory;
mod raw;
mod vmdk;

pub use memory::MemoryDecoder;
pub use raw::RawDecoder;
pub use vmdk::{parse_descriptor, VmdkDescriptor, VmdkExtent, VmdkExtentKind};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::common::{discover_e01_segments, discover_numbered_segments, DEFAULT_MAX_OPEN_FILES};
use crate::error::{DiscoveryError, Result};

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Format-specific decoder owned by exactly one [`ContainerStream`]
pub trait ContainerDecoder: Send {
    /// Fill `buf` with the bytes at `offset`; a short read is an error
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Logical (decoded) media size in bytes
    fn media_size(&self) -> u64;

    /// Release the backing resource
    fn close(&mut self) -> Result<()>;
}

/// Opens decoders for one container format
pub trait DecoderFactory: Send + Sync {
    fn format(&self) -> ContainerFormat;

    /// `constituents` lists every file of the container, primary first
    fn open(&self, constituents: &[PathBuf]) -> Result<Box<dyn ContainerDecoder>>;
}

/// Registered decoders for formats not decoded natively
#[derive(Default)]
pub struct DecoderRegistry {
    factories: HashMap<ContainerFormat, Box<dyn DecoderFactory>>,
    max_open_files: Option<usize>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the decoder for `factory.format()`
    pub fn register(&mut self, factory: Box<dyn DecoderFactory>) {
        debug!(format = %factory.format(), "Registered container decoder");
        self.factories.insert(factory.format(), factory);
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = Some(max_open_files);
        self
    }

    pub fn max_open_files(&self) -> usize {
        self.max_open_files.unwrap_or(DEFAULT_MAX_OPEN_FILES)
    }

    fn open_with(
        &self,
        format: ContainerFormat,
        constituents: &[PathBuf],
    ) -> Result<Box<dyn ContainerDecoder>> {
        let factory = self.factories.get(&format).ok_or_else(|| {
            DiscoveryError::UnsupportedFormat(format!("no decoder registered for {}", format))
        })?;
        factory.open(constituents)
    }
}

// =============================================================================
// Container Formats
// =============================================================================

/// Evidence container formats accepted as input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// Raw dd image, single or split (.001, .002, ...)
    Raw,
    /// Apple disk image without compression or encryption
    Dmg,
    /// Expert Witness Format (.E01, .E02, ...)
    E01,
    Aff4,
    /// Apple .sparseimage
    Sparse,
    Vmdk,
}

impl ContainerFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerFormat::Raw => "DD",
            ContainerFormat::Dmg => "DMG",
            ContainerFormat::E01 => "E01",
            ContainerFormat::Aff4 => "AFF4",
            ContainerFormat::Sparse => "SPARSE",
            ContainerFormat::Vmdk => "VMDK",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContainerFormat {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DD" | "RAW" => Ok(ContainerFormat::Raw),
            "DMG" => Ok(ContainerFormat::Dmg),
            "E01" => Ok(ContainerFormat::E01),
            "AFF4" => Ok(ContainerFormat::Aff4),
            "SPARSE" => Ok(ContainerFormat::Sparse),
            "VMDK" => Ok(ContainerFormat::Vmdk),
            other => Err(DiscoveryError::UnsupportedFormat(other.to_string())),
        }
    }
}

// =============================================================================
// Container Stream
// =============================================================================

/// Uniform read/size/close access to one evidence container
pub struct ContainerStream {
    label: String,
    size: u64,
    decoder: Mutex<Option<Box<dyn ContainerDecoder>>>,
}

impl ContainerStream {
    /// Open `path` as `format`, locating every constituent file first
    #[instrument(skip(registry))]
    pub fn open(format: ContainerFormat, path: &Path, registry: &DecoderRegistry) -> Result<Self> {
        let decoder: Box<dyn ContainerDecoder> = match format {
            ContainerFormat::Raw | ContainerFormat::Dmg => {
                let segments = discover_numbered_segments(path)?;
                Box::new(RawDecoder::new(segments, registry.max_open_files()))
            }
            ContainerFormat::E01 => {
                let segments = discover_e01_segments(path)?;
                registry.open_with(format, &segments.paths)?
            }
            ContainerFormat::Vmdk => vmdk::open(path, registry)?,
            ContainerFormat::Aff4 | ContainerFormat::Sparse => {
                if !path.is_file() {
                    return Err(DiscoveryError::IncompleteContainer {
                        path: path.to_path_buf(),
                        reason: "container file not found".to_string(),
                    });
                }
                registry.open_with(format, &[path.to_path_buf()])?
            }
        };

        let stream = Self::from_decoder(format!("{} {}", format, path.display()), decoder);
        info!(container = %stream.label, size = stream.size, "Opened evidence container");
        Ok(stream)
    }

    /// Wrap an already-open decoder
    pub fn from_decoder(label: impl Into<String>, decoder: Box<dyn ContainerDecoder>) -> Self {
        let size = decoder.media_size();
        Self {
            label: label.into(),
            size,
            decoder: Mutex::new(Some(decoder)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Read exactly `length` bytes at `offset`
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut guard = self.decoder.lock();
        let decoder = guard.as_mut().ok_or(DiscoveryError::ClosedStream)?;

        let end = offset.checked_add(length as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(DiscoveryError::read(
                offset,
                length,
                format!("range exceeds media size {}", self.size),
            ));
        }

        trace!(offset, length, "Container read");
        let mut buf = vec![0u8; length];
        decoder.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Logical media size in bytes
    pub fn size(&self) -> Result<u64> {
        if self.decoder.lock().is_none() {
            return Err(DiscoveryError::ClosedStream);
        }
        Ok(self.size)
    }

    /// Release the backing resource; later calls are no-ops
    pub fn close(&self) -> Result<()> {
        match self.decoder.lock().take() {
            Some(mut decoder) => {
                debug!(container = %self.label, "Closing evidence container");
                decoder.close()
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.decoder.lock().is_none()
    }
}

impl fmt::Debug for ContainerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerStream")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ContainerStream {
    fn drop(&mut self) {
        if let Some(mut decoder) = self.decoder.get_mut().take() {
            if let Err(e) = decoder.close() {
                tracing::warn!(container = %self.label, "Failed to close container: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingDecoder;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_read_within_bounds() {
        let stream = ContainerStream::from_decoder("mem", Box::new(MemoryDecoder::new((0..=255).collect())));
        assert_eq!(stream.size().unwrap(), 256);
        assert_eq!(stream.read(0x20, 4).unwrap(), vec![0x20, 0x21, 0x22, 0x23]);
        assert_eq!(stream.read(252, 4).unwrap(), vec![252, 253, 254, 255]);
    }

    #[test]
    fn test_short_read_is_error() {
        let stream = ContainerStream::from_decoder("mem", Box::new(MemoryDecoder::new(vec![0u8; 16])));
        let err = stream.read(12, 8).unwrap_err();
        assert!(matches!(err, DiscoveryError::Read { offset: 12, length: 8, .. }));
        assert!(stream.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_close_releases_once() {
        let (decoder, closes) = CountingDecoder::new(vec![0u8; 64]);
        let stream = ContainerStream::from_decoder("counting", Box::new(decoder));

        stream.close().unwrap();
        stream.close().unwrap();
        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_use_after_close() {
        let stream = ContainerStream::from_decoder("mem", Box::new(MemoryDecoder::new(vec![0u8; 64])));
        stream.close().unwrap();
        assert!(matches!(stream.read(0, 1), Err(DiscoveryError::ClosedStream)));
        assert!(matches!(stream.size(), Err(DiscoveryError::ClosedStream)));
        assert!(stream.is_closed());
    }

    #[test]
    fn test_drop_closes() {
        let (decoder, closes) = CountingDecoder::new(vec![0u8; 8]);
        drop(ContainerStream::from_decoder("counting", Box::new(decoder)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("dd".parse::<ContainerFormat>().unwrap(), ContainerFormat::Raw);
        assert_eq!("E01".parse::<ContainerFormat>().unwrap(), ContainerFormat::E01);
        assert_eq!("vmdk".parse::<ContainerFormat>().unwrap(), ContainerFormat::Vmdk);
        assert!("mounted".parse::<ContainerFormat>().is_err());
    }

    #[test]
    fn test_unregistered_format_is_unsupported() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let err = ContainerStream::open(ContainerFormat::Aff4, temp.path(), &DecoderRegistry::new()).unwrap_err();
        assert!(matches!(err, DiscoveryError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_registered_e01_receives_all_segments() {
        use std::sync::{Arc, Mutex as StdMutex};

        struct RecordingFactory(Arc<StdMutex<Vec<PathBuf>>>);
        impl DecoderFactory for RecordingFactory {
            fn format(&self) -> ContainerFormat {
                ContainerFormat::E01
            }
            fn open(&self, constituents: &[PathBuf]) -> Result<Box<dyn ContainerDecoder>> {
                self.0.lock().unwrap().extend_from_slice(constituents);
                Ok(Box::new(MemoryDecoder::new(vec![0u8; 4096])))
            }
        }

        let temp = tempfile::TempDir::new().unwrap();
        for name in ["case.E01", "case.E02", "case.E03"] {
            std::fs::write(temp.path().join(name), b"EVF").unwrap();
        }
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut registry = DecoderRegistry::new();
        registry.register(Box::new(RecordingFactory(Arc::clone(&seen))));

        let stream = ContainerStream::open(ContainerFormat::E01, &temp.path().join("case.E01"), &registry).unwrap();
        assert_eq!(stream.size().unwrap(), 4096);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
