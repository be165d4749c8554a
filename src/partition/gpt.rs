// GUID Partition Table reader
//
// LBA 0 holds the protective MBR, LBA 1 the header ("EFI PART"), followed by
// the entry array at `partition_entry_lba`. Header and array are CRC32
// protected; a bad header CRC rejects the candidate block size, a bad array
// CRC is only logged. Entries whose LBAs fall outside the image are skipped.

use tracing::{trace, warn};

use super::{block_range, fill_unallocated, PartitionDescriptor, PartitionFlag, PartitionScheme, PartitionTable};
use crate::common::binary::{read_array, read_u32_le, read_u64_le, utf16le_to_string};
use crate::error::Result;
use crate::stream::ContainerStream;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MIN_HEADER_SIZE: u32 = 92;
const MIN_ENTRY_SIZE: u32 = 128;
const MAX_ENTRIES: u32 = 4096;

pub(super) fn read_gpt(stream: &ContainerStream, block_size: u64, media_size: u64) -> Result<Option<PartitionTable>> {
    if media_size < block_size * 2 {
        return Ok(None);
    }
    let header = stream.read(block_size, block_size as usize)?;
    if &header[..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let header_size = read_u32_le(&header, 12)?;
    if header_size < MIN_HEADER_SIZE || header_size as u64 > block_size {
        warn!(header_size, "GPT header size out of range");
        return Ok(None);
    }
    let stored_crc = read_u32_le(&header, 16)?;
    let mut crc_input = header[..header_size as usize].to_vec();
    crc_input[16..20].fill(0);
    let computed_crc = crc32fast::hash(&crc_input);
    if stored_crc != computed_crc {
        warn!(stored_crc, computed_crc, block_size, "GPT header CRC mismatch");
        return Ok(None);
    }

    let entry_lba = read_u64_le(&header, 72)?;
    let entry_count = read_u32_le(&header, 80)?.min(MAX_ENTRIES);
    let entry_size = read_u32_le(&header, 84)?;
    let entries_crc = read_u32_le(&header, 88)?;
    if entry_size < MIN_ENTRY_SIZE {
        warn!(entry_size, "GPT entry size too small");
        return Ok(None);
    }
    trace!(entry_lba, entry_count, entry_size, "GPT header");

    let array_len = entry_count as usize * entry_size as usize;
    let array_blocks = (array_len as u64).div_ceil(block_size);
    let array_offset = match block_range(entry_lba, array_blocks, block_size, media_size) {
        Some((offset, length)) if length == array_blocks * block_size => offset,
        _ => {
            warn!(entry_lba, block_size, "GPT entry array lies outside the image");
            return Ok(None);
        }
    };
    let array = stream.read(array_offset, array_len)?;
    if crc32fast::hash(&array) != entries_crc {
        warn!("GPT partition entry array CRC mismatch");
    }

    let mut regions = vec![
        PartitionDescriptor::meta(0, block_size, "Safety Table"),
        PartitionDescriptor::meta(block_size, block_size, "GPT Header"),
        PartitionDescriptor::meta(array_offset, array_blocks * block_size, "Partition Table"),
    ];

    for (slot, entry) in array.chunks_exact(entry_size as usize).enumerate() {
        let type_guid: [u8; 16] = read_array(entry, 0)?;
        if type_guid == [0u8; 16] {
            continue;
        }
        let first_lba = read_u64_le(entry, 32)?;
        let last_lba = read_u64_le(entry, 40)?;
        if last_lba < first_lba {
            warn!(slot, first_lba, last_lba, "Skipping GPT entry with inverted range");
            continue;
        }
        let span = (last_lba - first_lba).checked_add(1);
        let Some((start_offset, length)) =
            span.and_then(|blocks| block_range(first_lba, blocks, block_size, media_size))
        else {
            warn!(slot, first_lba, last_lba, block_size, "Skipping GPT entry outside the image");
            continue;
        };
        let name = utf16le_to_string(&entry[56..128]);
        trace!(slot, first_lba, last_lba, %name, "GPT entry");

        regions.push(PartitionDescriptor {
            start_offset,
            length,
            flag: PartitionFlag::Allocated,
            description: name,
            slot_index: Some(slot as u32),
            type_guid: Some(type_guid),
        });
    }

    Ok(Some(PartitionTable {
        scheme: PartitionScheme::Gpt,
        block_size,
        partitions: fill_unallocated(regions, media_size),
    }))
}
