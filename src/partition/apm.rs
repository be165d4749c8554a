// Apple Partition Map reader
//
// Block 0 optionally holds the driver descriptor ("ER", big-endian block
// size). Map entries ("PM") follow one per block from block 1; every entry
// repeats the total entry count. The map describes itself with an
// "Apple_partition_map" entry, and free space with "Apple_Free".

use tracing::{trace, warn};

use super::{block_range, fill_unallocated, PartitionDescriptor, PartitionFlag, PartitionScheme, PartitionTable};
use crate::common::binary::{bytes_to_string, read_u16_be, read_u32_be};
use crate::error::Result;
use crate::stream::ContainerStream;

const DDM_SIGNATURE: u16 = 0x4552; // "ER"
const ENTRY_SIGNATURE: u16 = 0x504D; // "PM"
const MAX_ENTRIES: u32 = 256;

pub(super) fn read_apm(stream: &ContainerStream, media_size: u64) -> Result<Option<PartitionTable>> {
    let mut block_sizes = vec![512u64];
    if media_size >= 512 {
        let ddm = stream.read(0, 512)?;
        if read_u16_be(&ddm, 0)? == DDM_SIGNATURE {
            let ddm_block_size = read_u16_be(&ddm, 2)? as u64;
            if ddm_block_size > 512 && ddm_block_size.is_power_of_two() {
                block_sizes.push(ddm_block_size);
            }
        }
    }

    for block_size in block_sizes {
        if let Some(table) = read_entries(stream, block_size, media_size)? {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn read_entries(stream: &ContainerStream, block_size: u64, media_size: u64) -> Result<Option<PartitionTable>> {
    if media_size < block_size * 2 {
        return Ok(None);
    }
    let first = stream.read(block_size, 512)?;
    if read_u16_be(&first, 0)? != ENTRY_SIGNATURE {
        return Ok(None);
    }
    let entry_count = read_u32_be(&first, 4)?.min(MAX_ENTRIES);

    let mut regions = vec![PartitionDescriptor::meta(0, block_size, "Driver Descriptor")];
    for slot in 0..entry_count {
        let offset = block_size * (1 + slot as u64);
        if offset + 512 > media_size {
            warn!(slot, "APM entry lies beyond the end of the image");
            break;
        }
        let entry = stream.read(offset, 512)?;
        if read_u16_be(&entry, 0)? != ENTRY_SIGNATURE {
            warn!(slot, "APM entry signature missing, stopping");
            break;
        }
        let start_block = read_u32_be(&entry, 8)? as u64;
        let block_count = read_u32_be(&entry, 12)? as u64;
        let name = bytes_to_string(&entry[16..48]);
        let part_type = bytes_to_string(&entry[48..80]);
        trace!(slot, start_block, block_count, %name, %part_type, "APM entry");

        let Some((start_offset, length)) = block_range(start_block, block_count, block_size, media_size) else {
            warn!(slot, start_block, block_count, "Skipping APM entry outside the image");
            continue;
        };
        let flag = if part_type.eq_ignore_ascii_case("Apple_Free") {
            PartitionFlag::Unallocated
        } else {
            PartitionFlag::Allocated
        };
        regions.push(PartitionDescriptor {
            start_offset,
            length,
            flag,
            description: part_type,
            slot_index: Some(slot),
            type_guid: None,
        });
    }

    Ok(Some(PartitionTable {
        scheme: PartitionScheme::Apm,
        block_size,
        partitions: fill_unallocated(regions, media_size),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_stream;

    fn apm_entry(count: u32, start: u32, blocks: u32, name: &str, part_type: &str) -> Vec<u8> {
        let mut entry = vec![0u8; 512];
        entry[0..2].copy_from_slice(b"PM");
        entry[4..8].copy_from_slice(&count.to_be_bytes());
        entry[8..12].copy_from_slice(&start.to_be_bytes());
        entry[12..16].copy_from_slice(&blocks.to_be_bytes());
        entry[16..16 + name.len()].copy_from_slice(name.as_bytes());
        entry[48..48 + part_type.len()].copy_from_slice(part_type.as_bytes());
        entry
    }

    #[test]
    fn test_read_apm() {
        let mut image = vec![0u8; 512];
        image[0..2].copy_from_slice(b"ER");
        image[2..4].copy_from_slice(&512u16.to_be_bytes());
        image.extend(apm_entry(3, 1, 63, "Apple", "Apple_partition_map"));
        image.extend(apm_entry(3, 64, 200, "disk image", "Apple_HFS"));
        image.extend(apm_entry(3, 264, 8, "", "Apple_Free"));
        image.resize(272 * 512, 0);

        let stream = memory_stream(image);
        let table = read_apm(&stream, 272 * 512).unwrap().unwrap();
        assert_eq!(table.scheme, PartitionScheme::Apm);

        let hfs = table.partitions.iter().find(|p| p.description == "Apple_HFS").unwrap();
        assert_eq!(hfs.start_offset, 64 * 512);
        assert_eq!(hfs.length, 200 * 512);
        assert_eq!(hfs.slot_index, Some(1));

        let map = table.partitions.iter().find(|p| p.description == "Apple_partition_map").unwrap();
        assert!(map.is_skipped_by_description());
        let free = table.partitions.iter().find(|p| p.description == "Apple_Free").unwrap();
        assert_eq!(free.flag, PartitionFlag::Unallocated);
    }

    #[test]
    fn test_no_apm_signature() {
        let stream = memory_stream(vec![0u8; 8192]);
        assert!(read_apm(&stream, 8192).unwrap().is_none());
    }
}
