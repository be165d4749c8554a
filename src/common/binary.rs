// Shared binary decoding helpers for on-disk structures
//
// Partition tables mix endianness (GPT is little-endian, the Apple Partition
// Map is big-endian), so every helper names its byte order explicitly.

use crate::error::{DiscoveryError, Result};

// =============================================================================
// Fixed-width integers at a buffer offset
// =============================================================================

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| {
            DiscoveryError::read(
                offset as u64,
                N,
                format!("structure truncated (buffer is {} bytes)", buf.len()),
            )
        })
}

/// Read u16 little-endian at `offset`
pub fn read_u16_le(buf: &[u8], offset: usize) -> Result<u16> {
    field::<2>(buf, offset).map(u16::from_le_bytes)
}

/// Read u32 little-endian at `offset`
pub fn read_u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    field::<4>(buf, offset).map(u32::from_le_bytes)
}

/// Read u64 little-endian at `offset`
pub fn read_u64_le(buf: &[u8], offset: usize) -> Result<u64> {
    field::<8>(buf, offset).map(u64::from_le_bytes)
}

/// Read u16 big-endian at `offset`
pub fn read_u16_be(buf: &[u8], offset: usize) -> Result<u16> {
    field::<2>(buf, offset).map(u16::from_be_bytes)
}

/// Read u32 big-endian at `offset`
pub fn read_u32_be(buf: &[u8], offset: usize) -> Result<u32> {
    field::<4>(buf, offset).map(u32::from_be_bytes)
}

/// Copy a fixed-size byte array out of `buf`
pub fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    field::<N>(buf, offset)
}

// =============================================================================
// String Decoding
// =============================================================================

/// Convert bytes to null-terminated string
pub fn bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Decode a null-terminated UTF-16LE string (GPT partition names)
pub fn utf16le_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
