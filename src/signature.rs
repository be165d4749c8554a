//! Fixed-offset filesystem signatures
//!
//! Each check reads a handful of bytes at a documented offset and compares
//! them against a magic value. A failed read means "not present": absent
//! magic is never an error at this stage.

use tracing::trace;
use uuid::Uuid;

use crate::stream::ContainerStream;

/// APFS container superblock magic, at container offset 0x20
pub const APFS_MAGIC: &[u8; 4] = b"NXSB";
pub const APFS_MAGIC_OFFSET: u64 = 0x20;

/// HFS+ ("H+") and HFSX ("HX") volume header signatures, at volume offset 0x400
pub const HFS_PLUS_SIGNATURE: [u8; 2] = [0x48, 0x2B];
pub const HFSX_SIGNATURE: [u8; 2] = [0x48, 0x58];
pub const HFS_SIGNATURE_OFFSET: u64 = 0x400;

/// GPT type GUID 7C3457EF-0000-11AA-AA11-00306543ECAC in on-disk byte order
pub const APFS_PARTITION_TYPE: [u8; 16] = [
    0xEF, 0x57, 0x34, 0x7C, 0x00, 0x00, 0xAA, 0x11, 0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
];

/// Offset of the container UUID inside the APFS superblock
pub const APFS_UUID_OFFSET: u64 = 72;

fn read_at(stream: &ContainerStream, offset: u64, length: usize) -> Option<Vec<u8>> {
    match stream.read(offset, length) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            trace!(offset, length, "Signature read failed: {}", e);
            None
        }
    }
}

/// True when an APFS container superblock starts at `offset`
pub fn is_apfs_container(stream: &ContainerStream, offset: u64) -> bool {
    let Some(at) = offset.checked_add(APFS_MAGIC_OFFSET) else {
        return false;
    };
    read_at(stream, at, APFS_MAGIC.len()).is_some_and(|magic| magic == APFS_MAGIC)
}

/// True when an HFS+ or HFSX volume starts at `offset`
pub fn is_hfs_volume(stream: &ContainerStream, offset: u64) -> bool {
    let Some(at) = offset.checked_add(HFS_SIGNATURE_OFFSET) else {
        return false;
    };
    read_at(stream, at, 2).is_some_and(|sig| sig == HFS_PLUS_SIGNATURE || sig == HFSX_SIGNATURE)
}

/// True when the GPT entry type GUID at `type_guid_offset` is the Apple APFS type
pub fn is_apfs_boot_container(stream: &ContainerStream, type_guid_offset: u64) -> bool {
    read_at(stream, type_guid_offset, APFS_PARTITION_TYPE.len()).is_some_and(|guid| guid == APFS_PARTITION_TYPE)
}

/// Container UUID of the APFS superblock at `offset`, the metadata cache key
pub fn apfs_container_uuid(stream: &ContainerStream, offset: u64) -> Option<Uuid> {
    let at = offset.checked_add(APFS_UUID_OFFSET)?;
    let bytes = read_at(stream, at, 16)?;
    Uuid::from_slice(&bytes).ok()
}
