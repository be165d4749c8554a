// Common utilities shared across container decoders and table parsers

pub mod binary;
pub mod io_pool;
pub mod segments;

// Re-exports for convenience
pub use io_pool::{FileIoPool, DEFAULT_MAX_OPEN_FILES};
pub use segments::{discover_e01_segments, discover_numbered_segments, SegmentSet};
