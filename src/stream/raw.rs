// RAW disk image decoder (.dd, .raw, .img, .dmg, .001, .002, etc.)
// Supports single and multi-segment raw forensic images

use tracing::trace;

use super::ContainerDecoder;
use crate::common::{FileIoPool, SegmentSet};
use crate::error::{DiscoveryError, Result};

/// Concatenation of one or more raw segment files
pub struct RawDecoder {
    segment_sizes: Vec<u64>,
    total_size: u64,
    pool: FileIoPool,
}

impl RawDecoder {
    pub fn new(segments: SegmentSet, max_open_files: usize) -> Self {
        let total_size = segments.total_size();
        Self {
            segment_sizes: segments.sizes,
            total_size,
            pool: FileIoPool::new(segments.paths, max_open_files),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segment_sizes.len()
    }

    /// Convert absolute position to (segment_index, offset_within_segment)
    fn position_to_segment(&self, pos: u64) -> Option<(usize, u64)> {
        let mut offset = pos;
        for (idx, &size) in self.segment_sizes.iter().enumerate() {
            if offset < size {
                return Some((idx, offset));
            }
            offset -= size;
        }
        None
    }
}

impl ContainerDecoder for RawDecoder {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0usize;
        let mut position = offset;

        while filled < buf.len() {
            let (seg_idx, seg_offset) = self.position_to_segment(position).ok_or_else(|| {
                DiscoveryError::read(offset, buf.len(), format!("position {} is past the last segment", position))
            })?;

            let seg_remaining = self.segment_sizes[seg_idx] - seg_offset;
            let to_read = (buf.len() - filled).min(seg_remaining as usize);
            trace!(seg_idx, seg_offset, to_read, "Raw segment read");

            self.pool.read_exact_at(seg_idx, seg_offset, &mut buf[filled..filled + to_read])?;

            filled += to_read;
            position += to_read as u64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::discover_numbered_segments;
    use crate::stream::{ContainerFormat, ContainerStream, DecoderRegistry};
    use tempfile::TempDir;

    #[test]
    fn test_read_across_segments() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("img.001"), [1u8; 100]).unwrap();
        std::fs::write(temp.path().join("img.002"), [2u8; 50]).unwrap();
        std::fs::write(temp.path().join("img.003"), [3u8; 10]).unwrap();

        let set = discover_numbered_segments(&temp.path().join("img.001")).unwrap();
        let mut decoder = RawDecoder::new(set, 2);
        assert_eq!(decoder.segment_count(), 3);
        assert_eq!(decoder.media_size(), 160);

        let mut buf = [0u8; 60];
        decoder.read_at(95, &mut buf).unwrap();
        assert!(buf[..5].iter().all(|&b| b == 1));
        assert!(buf[5..55].iter().all(|&b| b == 2));
        assert!(buf[55..].iter().all(|&b| b == 3));
    }

    #[test]
    fn test_read_past_end_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("img.dd"), [0u8; 32]).unwrap();
        let set = discover_numbered_segments(&temp.path().join("img.dd")).unwrap();
        let mut decoder = RawDecoder::new(set, 4);

        let mut buf = [0u8; 8];
        assert!(decoder.read_at(30, &mut buf).is_err());
    }

    #[test]
    fn test_open_split_raw_stream() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("mac.001"), [7u8; 512]).unwrap();
        std::fs::write(temp.path().join("mac.002"), [8u8; 512]).unwrap();

        let stream = ContainerStream::open(
            ContainerFormat::Raw,
            &temp.path().join("mac.002"),
            &DecoderRegistry::new(),
        )
        .unwrap();
        assert_eq!(stream.size().unwrap(), 1024);
        assert_eq!(stream.read(510, 4).unwrap(), vec![7, 7, 8, 8]);
    }
}
