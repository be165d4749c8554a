//! HFS+ / HFSX volume access
//!
//! Catalog parsing is provided by the caller through [`HfsDecoder`]; this
//! crate only decides where a volume starts.

use std::sync::Arc;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::stream::ContainerStream;

/// Native HFS+ volume parser
pub trait HfsDecoder: Send + Sync {
    /// Mount the volume whose first byte is at `offset` in `stream`
    fn initialize(&self, stream: Arc<ContainerStream>, offset: u64) -> Result<Box<dyn FileSystem>>;
}
