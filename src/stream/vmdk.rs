// VMDK descriptor handling
//
// A VMDK is either a binary monolithic sparse file ("KDMV" magic, descriptor
// embedded) or a text descriptor listing extent files:
//
//   # Extent description
//   RW 8388608 FLAT "mac-f001.vmdk" 0
//   RW 2097152 SPARSE "mac-s002.vmdk"
//   RW 4096 ZERO
//
// Extent files are always resolved next to the descriptor, using only their
// file name. All extents must be present before the stream opens. Images made
// purely of FLAT/ZERO extents are read directly; anything with SPARSE extents
// goes to the registered VMDK decoder.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, trace};

use super::{ContainerDecoder, ContainerFormat, DecoderRegistry};
use crate::common::FileIoPool;
use crate::error::{DiscoveryError, Result};

const SECTOR_SIZE: u64 = 512;
const SPARSE_MAGIC: &[u8; 4] = b"KDMV";
const MAX_DESCRIPTOR_SIZE: u64 = 1024 * 1024;

/// Pre-compiled regex for descriptor extent lines
fn extent_regex() -> &'static Regex {
    static EXTENT_REGEX: OnceLock<Regex> = OnceLock::new();
    EXTENT_REGEX.get_or_init(|| {
        Regex::new(r#"^(RW|RDONLY|NOACCESS)\s+(\d+)\s+([A-Z]+)(?:\s+"([^"]*)"(?:\s+(\d+))?)?\s*$"#)
            .expect("Invalid extent regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmdkExtentKind {
    Flat,
    Sparse,
    Zero,
    /// VMFS variants and anything else we cannot read directly
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkExtent {
    pub kind: VmdkExtentKind,
    pub sectors: u64,
    pub filename: Option<String>,
    /// Start offset inside the extent file, in sectors (FLAT only)
    pub offset_sectors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmdkDescriptor {
    pub create_type: Option<String>,
    pub extents: Vec<VmdkExtent>,
}

impl VmdkDescriptor {
    pub fn total_size(&self) -> Result<u64> {
        self.extents.iter().try_fold(0u64, |total, e| {
            sectors_to_bytes(e.sectors)
                .and_then(|bytes| total.checked_add(bytes))
                .ok_or_else(|| DiscoveryError::UnsupportedFormat("VMDK extents exceed addressable size".to_string()))
        })
    }

    fn is_directly_readable(&self) -> bool {
        self.extents
            .iter()
            .all(|e| matches!(e.kind, VmdkExtentKind::Flat | VmdkExtentKind::Zero))
    }
}

fn sectors_to_bytes(sectors: u64) -> Option<u64> {
    sectors.checked_mul(SECTOR_SIZE)
}

fn parse_sectors(line: &str, field: &str) -> Result<u64> {
    field
        .parse::<u64>()
        .ok()
        .filter(|&sectors| sectors_to_bytes(sectors).is_some())
        .ok_or_else(|| DiscoveryError::UnsupportedFormat(format!("malformed VMDK extent line: {}", line)))
}

/// Parse a text descriptor
pub fn parse_descriptor(text: &str) -> Result<VmdkDescriptor> {
    let mut descriptor = VmdkDescriptor::default();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("createType") {
            let value = value.trim_start().trim_start_matches('=').trim().trim_matches('"');
            descriptor.create_type = Some(value.to_string());
            continue;
        }
        let Some(caps) = extent_regex().captures(line) else {
            continue;
        };
        let kind = match &caps[3] {
            "FLAT" => VmdkExtentKind::Flat,
            "SPARSE" => VmdkExtentKind::Sparse,
            "ZERO" => VmdkExtentKind::Zero,
            _ => VmdkExtentKind::Other,
        };
        let extent = VmdkExtent {
            kind,
            sectors: parse_sectors(line, &caps[2])?,
            filename: caps.get(4).map(|m| m.as_str().to_string()),
            offset_sectors: match caps.get(5) {
                Some(m) => parse_sectors(line, m.as_str())?,
                None => 0,
            },
        };
        trace!(?extent, "VMDK extent");
        descriptor.extents.push(extent);
    }

    Ok(descriptor)
}

/// Strip any directory part (either separator) from an extent file name
fn extent_basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Locate every extent file next to the descriptor
fn locate_extents(descriptor_path: &Path, descriptor: &VmdkDescriptor) -> Result<Vec<Option<PathBuf>>> {
    let base_dir = match descriptor_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    descriptor
        .extents
        .iter()
        .map(|extent| match (&extent.kind, &extent.filename) {
            (VmdkExtentKind::Zero, _) => Ok(None),
            (_, Some(name)) => {
                let candidate = base_dir.join(extent_basename(name));
                if candidate.is_file() {
                    Ok(Some(candidate))
                } else {
                    Err(DiscoveryError::IncompleteContainer {
                        path: descriptor_path.to_path_buf(),
                        reason: format!("unable to locate extent data file '{}'", name),
                    })
                }
            }
            (_, None) => Err(DiscoveryError::IncompleteContainer {
                path: descriptor_path.to_path_buf(),
                reason: "extent without a file name".to_string(),
            }),
        })
        .collect()
}

/// Open a VMDK, reading flat images directly
pub(super) fn open(path: &Path, registry: &DecoderRegistry) -> Result<Box<dyn ContainerDecoder>> {
    let mut file = File::open(path).map_err(|e| DiscoveryError::IncompleteContainer {
        path: path.to_path_buf(),
        reason: format!("cannot open descriptor: {}", e),
    })?;

    let mut head = Vec::new();
    (&mut file).take(MAX_DESCRIPTOR_SIZE).read_to_end(&mut head)?;

    if head.starts_with(SPARSE_MAGIC) {
        debug!(?path, "Monolithic sparse VMDK");
        return registry.open_with(ContainerFormat::Vmdk, &[path.to_path_buf()]);
    }

    let descriptor = parse_descriptor(&String::from_utf8_lossy(&head))?;
    if descriptor.extents.is_empty() {
        return Err(DiscoveryError::UnsupportedFormat(format!(
            "{} has no VMDK extent descriptions",
            path.display()
        )));
    }

    let located = locate_extents(path, &descriptor)?;
    debug!(
        extents = descriptor.extents.len(),
        create_type = ?descriptor.create_type,
        "Located all VMDK extents"
    );

    if descriptor.is_directly_readable() {
        return Ok(Box::new(VmdkFlatDecoder::new(&descriptor, located, registry.max_open_files())?));
    }

    let mut constituents = vec![path.to_path_buf()];
    constituents.extend(located.into_iter().flatten());
    registry.open_with(ContainerFormat::Vmdk, &constituents)
}

// =============================================================================
// Flat Extent Decoder
// =============================================================================

struct FlatExtent {
    size: u64,
    /// Pool index and byte offset inside the file; None for ZERO extents
    backing: Option<(usize, u64)>,
}

struct VmdkFlatDecoder {
    extents: Vec<FlatExtent>,
    total_size: u64,
    pool: FileIoPool,
}

impl VmdkFlatDecoder {
    fn new(descriptor: &VmdkDescriptor, located: Vec<Option<PathBuf>>, max_open: usize) -> Result<Self> {
        let total_size = descriptor.total_size()?;
        let mut paths = Vec::new();
        let mut extents = Vec::with_capacity(descriptor.extents.len());

        for (extent, path) in descriptor.extents.iter().zip(located) {
            let malformed =
                || DiscoveryError::UnsupportedFormat(format!("VMDK extent {:?} is out of range", extent.filename));
            let size = sectors_to_bytes(extent.sectors).ok_or_else(malformed)?;
            let backing = match path {
                Some(p) => {
                    let start = sectors_to_bytes(extent.offset_sectors)
                        .filter(|start| start.checked_add(size).is_some())
                        .ok_or_else(malformed)?;
                    paths.push(p);
                    Some((paths.len() - 1, start))
                }
                None => None,
            };
            extents.push(FlatExtent { size, backing });
        }

        Ok(Self {
            total_size,
            extents,
            pool: FileIoPool::new(paths, max_open),
        })
    }
}

impl ContainerDecoder for VmdkFlatDecoder {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        let mut position = offset;
        let mut extent_start = 0u64;

        for extent in &self.extents {
            if filled == buf.len() {
                break;
            }
            let extent_end = extent_start + extent.size;
            if position >= extent_end {
                extent_start = extent_end;
                continue;
            }

            let within = position - extent_start;
            let to_read = (buf.len() - filled).min((extent.size - within) as usize);
            let target = &mut buf[filled..filled + to_read];
            match extent.backing {
                None => target.fill(0),
                Some((file_index, file_offset)) => self.pool.read_exact_at(file_index, file_offset + within, target)?,
            }

            filled += to_read;
            position += to_read as u64;
            extent_start = extent_end;
        }

        if filled < buf.len() {
            return Err(DiscoveryError::read(offset, buf.len(), "range exceeds VMDK extents"));
        }
        Ok(())
    }

    fn media_size(&self) -> u64 {
        self.total_size
    }

    fn close(&mut self) -> Result<()> {
        self.pool.close_all();
        Ok(())
    }
}
