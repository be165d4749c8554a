// Bounded set of open segment files
//
// Split raw images and multi-extent VMDKs can span hundreds of files. Only
// `max_open` of them are held open; the least recently read one is closed
// when another has to be opened.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, trace};

use crate::error::{DiscoveryError, Result};

/// Default cap on simultaneously open segment files
pub const DEFAULT_MAX_OPEN_FILES: usize = 32;

pub struct FileIoPool {
    paths: Vec<PathBuf>,
    handles: Vec<Option<File>>,
    /// Open segment indices, least recently read first
    recent: VecDeque<usize>,
    max_open: usize,
}

impl FileIoPool {
    pub fn new(paths: Vec<PathBuf>, max_open: usize) -> Self {
        let handles = paths.iter().map(|_| None).collect();
        Self {
            paths,
            handles,
            recent: VecDeque::new(),
            max_open: max_open.max(1),
        }
    }

    /// Fill `buf` from segment `index` starting at byte `offset` of that file
    pub fn read_exact_at(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let file = self.touch(index)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| DiscoveryError::read(offset, len, format!("segment {}: {}", index, e)))
    }

    fn touch(&mut self, index: usize) -> Result<&mut File> {
        if index >= self.paths.len() {
            return Err(DiscoveryError::Filesystem(format!(
                "segment {} out of range ({} segments)",
                index,
                self.paths.len()
            )));
        }

        if self.handles[index].is_some() {
            self.recent.retain(|&i| i != index);
        } else {
            while self.recent.len() >= self.max_open {
                let Some(evicted) = self.recent.pop_front() else {
                    break;
                };
                trace!(evicted, "Closing least recently read segment");
                self.handles[evicted] = None;
            }
            let path = &self.paths[index];
            debug!(index, ?path, "Opening segment");
            self.handles[index] = Some(File::open(path)?);
        }
        self.recent.push_back(index);

        self.handles[index]
            .as_mut()
            .ok_or_else(|| DiscoveryError::Filesystem(format!("segment {} is not open", index)))
    }

    pub fn open_count(&self) -> usize {
        self.recent.len()
    }

    pub fn close_all(&mut self) {
        debug!(open = self.recent.len(), "Closing segment files");
        self.handles.iter_mut().for_each(|h| *h = None);
        self.recent.clear();
    }
}
