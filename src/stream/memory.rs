// In-memory decoder for images already loaded into memory

use super::ContainerDecoder;
use crate::error::{DiscoveryError, Result};

pub struct MemoryDecoder {
    data: Vec<u8>,
}

impl MemoryDecoder {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ContainerDecoder for MemoryDecoder {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| DiscoveryError::read(offset, buf.len(), "offset exceeds address space"))?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| DiscoveryError::read(offset, buf.len(), "range exceeds buffer"))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn media_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        self.data = Vec::new();
        Ok(())
    }
}
