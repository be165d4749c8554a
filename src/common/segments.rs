// Segment discovery for multi-file evidence containers
//
// Handles the naming schemes used by split images:
// - Numbered segments: .001, .002, .003, etc. (split dd / raw)
// - EWF segments: .E01 ... .E99, then .EAA ... .EZZ, .FAA ... (libewf naming)
//
// Every constituent is located relative to the primary file's directory
// before the container is opened. A gap in a sequence is fatal.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{DiscoveryError, Result};

/// Ordered constituent files of one logical container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSet {
    pub paths: Vec<PathBuf>,
    pub sizes: Vec<u64>,
}

impl SegmentSet {
    fn single(path: &Path) -> Result<Self> {
        let size = fs::metadata(path)?.len();
        Ok(Self {
            paths: vec![path.to_path_buf()],
            sizes: vec![size],
        })
    }

    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn incomplete(path: &Path, reason: impl Into<String>) -> DiscoveryError {
    DiscoveryError::IncompleteContainer {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

// =============================================================================
// Numbered Segment Discovery (.001, .002, etc.)
// =============================================================================

fn numbered_extension(filename: &str) -> Option<u32> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit()) {
        ext.parse().ok()
    } else {
        None
    }
}

/// Discover numbered segments (.001, .002, etc.) starting from any segment
///
/// Non-numbered paths are returned as a single-file set. Matching is
/// case-insensitive on the base name; the sequence must start at 1 and be
/// contiguous.
pub fn discover_numbered_segments(path: &Path) -> Result<SegmentSet> {
    debug!(?path, "Discovering numbered segments");
    if !path.exists() {
        return Err(incomplete(path, "primary file not found"));
    }
    let filename = path
        .file_name()
        .ok_or_else(|| incomplete(path, "invalid filename"))?
        .to_string_lossy()
        .to_string();

    if numbered_extension(&filename).is_none() {
        debug!(?path, "Single file (non-segmented)");
        return SegmentSet::single(path);
    }

    let base_lower = filename[..filename.len() - 4].to_lowercase();
    let mut found: Vec<(u32, PathBuf, u64)> = Vec::new();
    for entry in fs::read_dir(parent_dir(path))?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(num) = numbered_extension(&name) else {
            continue;
        };
        if name[..name.len() - 4].to_lowercase() != base_lower {
            continue;
        }
        let size = entry.metadata()?.len();
        trace!(segment = num, %name, size, "Found numbered segment");
        found.push((num, entry.path(), size));
    }
    found.sort_by_key(|(num, _, _)| *num);

    for (expected, (num, _, _)) in (1u32..).zip(found.iter()) {
        if *num != expected {
            return Err(incomplete(
                path,
                format!("segment .{:03} is missing", expected),
            ));
        }
    }

    debug!(segment_count = found.len(), "Numbered segments discovered");
    Ok(SegmentSet {
        paths: found.iter().map(|(_, p, _)| p.clone()).collect(),
        sizes: found.iter().map(|(_, _, s)| *s).collect(),
    })
}

// =============================================================================
// EWF Segment Discovery (.E01, .E02, ..., .EAA, etc.)
// =============================================================================

/// Extension for EWF segment `number` (1-based), following libewf naming
pub fn ewf_segment_extension(first_letter: char, number: u32) -> Option<String> {
    if number == 0 {
        return None;
    }
    if number <= 99 {
        return Some(format!("{}{:02}", first_letter, number));
    }
    let index = number - 100;
    let lead = (first_letter as u32) + index / 676;
    let lead = char::from_u32(lead).filter(|c| c.is_ascii_uppercase())?;
    let second = char::from(b'A' + ((index / 26) % 26) as u8);
    let third = char::from(b'A' + (index % 26) as u8);
    Some(format!("{}{}{}", lead, second, third))
}

/// Discover EWF segments given the path to the first (.E01) segment
pub fn discover_e01_segments(path: &Path) -> Result<SegmentSet> {
    debug!(?path, "Discovering E01 segments");
    if !path.exists() {
        return Err(incomplete(path, "primary segment not found"));
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let lowercase = ext.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let first_letter = ext
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| matches!(c, 'E' | 'L' | 'S'))
        .ok_or_else(|| incomplete(path, format!("'.{}' is not an EWF segment extension", ext)))?;

    let mut set = SegmentSet::single(path)?;
    for number in 2.. {
        let Some(next_ext) = ewf_segment_extension(first_letter, number) else {
            break;
        };
        let next_ext = if lowercase { next_ext.to_lowercase() } else { next_ext };
        let candidate = path.with_extension(&next_ext);
        match fs::metadata(&candidate) {
            Ok(meta) => {
                trace!(segment = number, ?candidate, "Found E01 segment");
                set.paths.push(candidate);
                set.sizes.push(meta.len());
            }
            Err(_) => break,
        }
    }

    debug!(segment_count = set.len(), "E01 segments discovered");
    Ok(set)
}
