//! Partition table scanning
//!
//! Reads the partition table of a [`ContainerStream`] and yields
//! [`PartitionDescriptor`]s in table order, in the same shape a volume-system
//! walker produces: metadata regions (protective MBR, GPT header, entry
//! array) flagged [`PartitionFlag::Meta`], partitions flagged
//! [`PartitionFlag::Allocated`] and the gaps between them flagged
//! [`PartitionFlag::Unallocated`].
//!
//! GPT is tried first (512- then 4096-byte logical blocks), then the Apple
//! Partition Map used by older Macs and many DMGs.

mod apm;
mod gpt;

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::{DiscoveryError, Result};
use crate::stream::ContainerStream;

/// Size of one GPT partition entry as addressed by the bootable-marker check
pub const GPT_ENTRY_SIZE: u64 = 128;

/// Descriptions that can never hold a macOS root
const SKIPPED_DESCRIPTIONS: [&str; 2] = ["EFI SYSTEM PARTITION", "APPLE_PARTITION_MAP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionFlag {
    Meta,
    Allocated,
    Unallocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionScheme {
    Gpt,
    Apm,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Gpt => f.write_str("GPT"),
            PartitionScheme::Apm => f.write_str("APM"),
        }
    }
}

/// One region of the partitioned disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    /// Byte offset from the start of the image
    pub start_offset: u64,
    /// Byte length
    pub length: u64,
    pub flag: PartitionFlag,
    pub description: String,
    /// Entry index in the on-disk table; None for metadata and gaps
    pub slot_index: Option<u32>,
    /// GPT partition type GUID as stored on disk
    #[serde(skip)]
    pub type_guid: Option<[u8; 16]>,
}

impl PartitionDescriptor {
    pub(crate) fn meta(start_offset: u64, length: u64, description: &str) -> Self {
        Self {
            start_offset,
            length,
            flag: PartitionFlag::Meta,
            description: description.to_string(),
            slot_index: None,
            type_guid: None,
        }
    }

    pub(crate) fn unallocated(start_offset: u64, length: u64) -> Self {
        Self {
            start_offset,
            length,
            flag: PartitionFlag::Unallocated,
            description: "Unallocated".to_string(),
            slot_index: None,
            type_guid: None,
        }
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.length
    }

    pub fn is_allocated(&self) -> bool {
        self.flag == PartitionFlag::Allocated
    }

    /// Entries that are never handed to the filesystem detectors
    pub fn is_skipped_by_description(&self) -> bool {
        let upper = self.description.trim().to_uppercase();
        SKIPPED_DESCRIPTIONS.contains(&upper.as_str())
    }
}

/// Parsed partition table
#[derive(Debug, Clone, Serialize)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub block_size: u64,
    pub partitions: Vec<PartitionDescriptor>,
}

/// Read the partition table of `stream`
pub fn scan_partitions(stream: &ContainerStream) -> Result<PartitionTable> {
    let media_size = stream.size()?;

    for block_size in [512u64, 4096] {
        match gpt::read_gpt(stream, block_size, media_size) {
            Ok(Some(table)) => {
                info!(block_size, entries = table.partitions.len(), "Found GPT partition table");
                return Ok(table);
            }
            Ok(None) => trace!(block_size, "No GPT header"),
            Err(e) => debug!(block_size, "GPT read failed: {}", e),
        }
    }

    match apm::read_apm(stream, media_size) {
        Ok(Some(table)) => {
            info!(entries = table.partitions.len(), "Found Apple Partition Map");
            Ok(table)
        }
        Ok(None) => Err(DiscoveryError::NoPartitionTable),
        Err(e) => {
            debug!("APM read failed: {}", e);
            Err(DiscoveryError::NoPartitionTable)
        }
    }
}

/// Byte range of `block_count` blocks starting at `first_block`
///
/// `None` when the arithmetic overflows or the range starts at or past the
/// end of the media. A range running past the end is cut at `media_size`.
pub(crate) fn block_range(first_block: u64, block_count: u64, block_size: u64, media_size: u64) -> Option<(u64, u64)> {
    let start = first_block.checked_mul(block_size)?;
    let length = block_count.checked_mul(block_size)?;
    if start >= media_size {
        return None;
    }
    Some((start, length.min(media_size - start)))
}

/// Sort regions by start and fill the uncovered gaps with unallocated entries
pub(crate) fn fill_unallocated(mut regions: Vec<PartitionDescriptor>, media_size: u64) -> Vec<PartitionDescriptor> {
    regions.sort_by_key(|d| (d.start_offset, d.flag != PartitionFlag::Meta));

    let mut out = Vec::with_capacity(regions.len() * 2);
    let mut cursor = 0u64;
    for region in regions {
        if region.start_offset > cursor {
            out.push(PartitionDescriptor::unallocated(cursor, region.start_offset - cursor));
        }
        cursor = cursor.max(region.end_offset());
        out.push(region);
    }
    if media_size > cursor {
        out.push(PartitionDescriptor::unallocated(cursor, media_size - cursor));
    }
    out
}

// =============================================================================
// Partition Walk
// =============================================================================

/// An allocated partition worth handing to the filesystem detectors
#[derive(Debug, Clone)]
pub struct PartitionCandidate {
    pub descriptor: PartitionDescriptor,
    /// Byte offset of this entry's type GUID in the GPT entry array
    pub type_guid_offset: Option<u64>,
}

/// Apply the walk rules to a table, in table order
///
/// A META "GPT Header" entry fixes the entry-array base; unallocated entries
/// and EFI System / Apple partition-map entries are skipped.
pub fn walk_partitions(table: &PartitionTable) -> Vec<PartitionCandidate> {
    let mut partitions_offset: Option<u64> = None;
    let mut candidates = Vec::new();

    for part in &table.partitions {
        match part.flag {
            PartitionFlag::Meta if part.description == "GPT Header" => {
                let header_offset = part.start_offset;
                partitions_offset = Some(header_offset + table.block_size);
                trace!(header_offset, "GPT header located");
            }
            PartitionFlag::Allocated => {
                if part.is_skipped_by_description() {
                    debug!(
                        offset = part.start_offset,
                        "Skipping '{}' partition", part.description
                    );
                    continue;
                }
                let type_guid_offset = match (partitions_offset, part.slot_index) {
                    (Some(base), Some(slot)) => Some(base + GPT_ENTRY_SIZE * slot as u64),
                    _ => None,
                };
                candidates.push(PartitionCandidate {
                    descriptor: part.clone(),
                    type_guid_offset,
                });
            }
            _ => {}
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gpt_image, GptPart, APFS_TYPE_GUID, EFI_TYPE_GUID, HFS_TYPE_GUID};

    fn allocated(start: u64, description: &str, slot: u32) -> PartitionDescriptor {
        PartitionDescriptor {
            start_offset: start,
            length: 4096,
            flag: PartitionFlag::Allocated,
            description: description.to_string(),
            slot_index: Some(slot),
            type_guid: None,
        }
    }

    #[test]
    fn test_walk_skips_efi_any_case() {
        let table = PartitionTable {
            scheme: PartitionScheme::Gpt,
            block_size: 512,
            partitions: vec![
                PartitionDescriptor::meta(0, 512, "Safety Table"),
                PartitionDescriptor::meta(512, 512, "GPT Header"),
                allocated(20480, "EFI System Partition", 0),
                allocated(40960, "efi system partition", 1),
                allocated(61440, "Apple_partition_map", 2),
                PartitionDescriptor::unallocated(81920, 4096),
                allocated(102400, "Macintosh HD", 3),
            ],
        };

        let candidates = walk_partitions(&table);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].descriptor.description, "Macintosh HD");
        assert_eq!(candidates[0].type_guid_offset, Some(1024 + 128 * 3));
    }

    #[test]
    fn test_walk_without_gpt_header_has_no_marker_offset() {
        let table = PartitionTable {
            scheme: PartitionScheme::Apm,
            block_size: 512,
            partitions: vec![allocated(32768, "Apple_HFS", 1)],
        };
        let candidates = walk_partitions(&table);
        assert_eq!(candidates[0].type_guid_offset, None);
    }

    #[test]
    fn test_fill_unallocated() {
        let regions = vec![
            allocated(4096, "B", 1),
            PartitionDescriptor::meta(0, 1024, "Safety Table"),
        ];
        let out = fill_unallocated(regions, 16384);
        let flags: Vec<_> = out.iter().map(|d| d.flag).collect();
        assert_eq!(
            flags,
            vec![
                PartitionFlag::Meta,
                PartitionFlag::Unallocated,
                PartitionFlag::Allocated,
                PartitionFlag::Unallocated
            ]
        );
        assert_eq!(out[1].start_offset, 1024);
        assert_eq!(out[3].length, 16384 - 8192);
    }

    #[test]
    fn test_scan_gpt_image() {
        let image = gpt_image(
            &[
                GptPart::new(EFI_TYPE_GUID, "EFI System Partition", 40, 64),
                GptPart::new(HFS_TYPE_GUID, "Macintosh HD", 128, 256),
                GptPart::new(APFS_TYPE_GUID, "Container", 512, 256),
            ],
            1024,
        );
        let stream = crate::testing::memory_stream(image);
        let table = scan_partitions(&stream).unwrap();

        assert_eq!(table.scheme, PartitionScheme::Gpt);
        assert_eq!(table.block_size, 512);
        let header = table.partitions.iter().find(|p| p.description == "GPT Header").unwrap();
        assert_eq!(header.start_offset, 512);
        let allocated: Vec<_> = table.partitions.iter().filter(|p| p.is_allocated()).collect();
        assert_eq!(allocated.len(), 3);
        assert_eq!(allocated[1].start_offset, 128 * 512);
        assert_eq!(allocated[1].length, 256 * 512);
        assert_eq!(allocated[2].slot_index, Some(2));
        assert_eq!(allocated[2].type_guid, Some(APFS_TYPE_GUID));
    }

    #[test]
    fn test_scan_skips_entries_outside_image() {
        let image = gpt_image(
            &[
                GptPart::new(HFS_TYPE_GUID, "Damaged", u64::MAX / 4, 16),
                GptPart::new(HFS_TYPE_GUID, "Past the end", 5000, 64),
                GptPart::new(HFS_TYPE_GUID, "Macintosh HD", 128, 256),
                GptPart::new(APFS_TYPE_GUID, "Truncated", 900, 500),
            ],
            1024,
        );
        let stream = crate::testing::memory_stream(image);
        let table = scan_partitions(&stream).unwrap();

        let allocated: Vec<_> = table.partitions.iter().filter(|p| p.is_allocated()).collect();
        assert_eq!(allocated.len(), 2);
        assert_eq!(allocated[0].description, "Macintosh HD");
        assert_eq!(allocated[1].slot_index, Some(3));
        assert_eq!(allocated[1].start_offset, 900 * 512);
        assert_eq!(allocated[1].end_offset(), 1024 * 512);
        assert!(table.partitions.iter().all(|p| p.end_offset() <= 1024 * 512));
    }

    #[test]
    fn test_block_range_bounds() {
        assert_eq!(block_range(2, 4, 512, 8192), Some((1024, 2048)));
        assert_eq!(block_range(14, 4, 512, 8192), Some((7168, 1024)));
        assert_eq!(block_range(16, 1, 512, 8192), None);
        assert_eq!(block_range(u64::MAX / 4, 1, 512, u64::MAX), None);
        assert_eq!(block_range(1, u64::MAX, 512, u64::MAX), None);
    }

    #[test]
    fn test_scan_blank_image_has_no_table() {
        let stream = crate::testing::memory_stream(vec![0u8; 64 * 1024]);
        assert!(matches!(scan_partitions(&stream), Err(DiscoveryError::NoPartitionTable)));
    }
}
