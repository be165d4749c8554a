//! Discovery state machine
//!
//! ```text
//! Start -> WholeImageApfs -> WholeImageHfs -> PartitionScan -> Found | NotFound
//! ```
//!
//! - `WholeImageApfs`: an APFS superblock at offset 0 (container-only image)
//!   is handed to the orchestrator; whatever it returns ends the run.
//! - `WholeImageHfs`: an HFS+ header at offset 0 is validated directly;
//!   whatever it returns ends the run.
//! - `PartitionScan`: the partition table is read once, then one candidate
//!   is evaluated per step. APFS containers are only attempted when their
//!   GPT entry carries the APFS type GUID. The first validated candidate
//!   ends the run.
//!
//! A failing candidate is recorded and logged; only errors that are not
//! candidate-local (closed stream, configuration) abort the run.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::apfs::{ApfsDecoder, ApfsVolumeOrchestrator, Credential};
use crate::context::{DiscoveryPath, MacFilesystem, MacOsInstallation};
use crate::error::{DiscoveryError, Result};
use crate::fs::{FirmlinkMap, MountedDirectory};
use crate::hfs::HfsDecoder;
use crate::partition::{scan_partitions, walk_partitions, PartitionCandidate};
use crate::signature::{apfs_container_uuid, is_apfs_boot_container, is_apfs_container, is_hfs_volume};
use crate::stream::ContainerStream;
use crate::validator;

/// Run-wide settings shared by every candidate
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Directory receiving the per-container metadata caches
    pub output_dir: PathBuf,
    pub credential: Option<Credential>,
    /// False when the image was acquired already decrypted
    pub decrypt_on_read: bool,
    pub firmlinks: FirmlinkMap,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            credential: None,
            decrypt_on_read: true,
            firmlinks: FirmlinkMap::default(),
        }
    }
}

/// A candidate that was attempted and failed
#[derive(Debug)]
pub struct CandidateFailure {
    pub offset: u64,
    pub description: String,
    pub error: DiscoveryError,
}

enum State {
    Start,
    WholeImageApfs,
    WholeImageHfs,
    /// `None` until the partition table has been read
    PartitionScan(Option<VecDeque<PartitionCandidate>>),
    Found(Box<MacOsInstallation>),
    NotFound,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Start => "Start",
            State::WholeImageApfs => "WholeImageApfs",
            State::WholeImageHfs => "WholeImageHfs",
            State::PartitionScan(_) => "PartitionScan",
            State::Found(_) => "Found",
            State::NotFound => "NotFound",
        }
    }
}

/// Drives one discovery run over one evidence container
pub struct DiscoveryController<'a> {
    stream: Arc<ContainerStream>,
    apfs: &'a dyn ApfsDecoder,
    hfs: &'a dyn HfsDecoder,
    options: DiscoveryOptions,
    failures: Vec<CandidateFailure>,
}

impl<'a> DiscoveryController<'a> {
    pub fn new(
        stream: Arc<ContainerStream>,
        apfs: &'a dyn ApfsDecoder,
        hfs: &'a dyn HfsDecoder,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            stream,
            apfs,
            hfs,
            options,
            failures: Vec::new(),
        }
    }

    /// Candidates attempted during the last run that failed
    pub fn failures(&self) -> &[CandidateFailure] {
        &self.failures
    }

    /// Run to a terminal state; NOT_FOUND is `Err(NoMacOsFound)`
    #[instrument(skip(self), fields(container = %self.stream.label()))]
    pub fn run(&mut self) -> Result<MacOsInstallation> {
        std::fs::create_dir_all(&self.options.output_dir).map_err(|e| {
            DiscoveryError::Config(format!(
                "cannot create output directory {}: {}",
                self.options.output_dir.display(),
                e
            ))
        })?;
        self.failures.clear();

        let mut state = State::Start;
        loop {
            state = match state {
                State::Found(installation) => {
                    info!("{}", installation.summary());
                    return Ok(*installation);
                }
                State::NotFound => {
                    warn!(failed_candidates = self.failures.len(), "No macOS installation found");
                    return Err(DiscoveryError::NoMacOsFound);
                }
                other => {
                    let from = other.name();
                    let next = self.step(other)?;
                    debug!(from, to = next.name(), "Discovery transition");
                    next
                }
            };
        }
    }

    fn step(&mut self, state: State) -> Result<State> {
        Ok(match state {
            State::Start => State::WholeImageApfs,

            State::WholeImageApfs => {
                if !is_apfs_container(&self.stream, 0) {
                    State::WholeImageHfs
                } else {
                    info!("APFS container at start of image");
                    let length = self.stream.size()?;
                    let attempt = self.try_apfs(0, length, DiscoveryPath::WholeImageApfs);
                    self.conclude(attempt, 0, "whole image APFS container")?
                }
            }

            State::WholeImageHfs => {
                if !is_hfs_volume(&self.stream, 0) {
                    State::PartitionScan(None)
                } else {
                    info!("HFS+ volume at start of image");
                    let attempt = self.try_hfs(0, DiscoveryPath::WholeImageHfs);
                    self.conclude(attempt, 0, "whole image HFS+ volume")?
                }
            }

            State::PartitionScan(None) => match scan_partitions(&self.stream) {
                Ok(table) => {
                    info!(scheme = %table.scheme, block_size = table.block_size, "Walking partition table");
                    State::PartitionScan(Some(walk_partitions(&table).into()))
                }
                Err(DiscoveryError::NoPartitionTable) => {
                    warn!("No recognizable filesystem or partition table in image");
                    State::NotFound
                }
                Err(e) => return Err(e),
            },

            State::PartitionScan(Some(mut remaining)) => match remaining.pop_front() {
                None => State::NotFound,
                Some(candidate) => match self.evaluate_partition(&candidate)? {
                    Some(installation) => State::Found(Box::new(installation)),
                    None => State::PartitionScan(Some(remaining)),
                },
            },

            terminal @ (State::Found(_) | State::NotFound) => terminal,
        })
    }

    /// Terminal transition for a whole-image attempt
    fn conclude(&mut self, attempt: Result<Option<MacOsInstallation>>, offset: u64, what: &str) -> Result<State> {
        Ok(match self.absorb(attempt, offset, what)? {
            Some(installation) => State::Found(Box::new(installation)),
            None => State::NotFound,
        })
    }

    /// Record candidate-local failures, propagate the rest
    fn absorb(
        &mut self,
        attempt: Result<Option<MacOsInstallation>>,
        offset: u64,
        what: &str,
    ) -> Result<Option<MacOsInstallation>> {
        match attempt {
            Ok(found) => Ok(found),
            Err(e) if e.is_candidate_local() => {
                error!(offset, "{} failed: {}", what, e);
                self.failures.push(CandidateFailure {
                    offset,
                    description: what.to_string(),
                    error: e,
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn evaluate_partition(&mut self, candidate: &PartitionCandidate) -> Result<Option<MacOsInstallation>> {
        let part = &candidate.descriptor;
        let what = format!("partition '{}'", part.description);
        debug!(offset = part.start_offset, length = part.length, "Evaluating {}", what);

        let attempt = if is_apfs_container(&self.stream, part.start_offset) {
            let bootable = candidate
                .type_guid_offset
                .is_some_and(|offset| is_apfs_boot_container(&self.stream, offset));
            if !bootable {
                info!(offset = part.start_offset, "Skipping APFS container without the APFS partition type");
                return Ok(None);
            }
            self.try_apfs(part.start_offset, part.length, DiscoveryPath::Partition)
        } else if is_hfs_volume(&self.stream, part.start_offset) {
            self.try_hfs(part.start_offset, DiscoveryPath::Partition)
        } else {
            debug!(offset = part.start_offset, "No APFS or HFS+ signature");
            return Ok(None);
        };

        self.absorb(attempt, part.start_offset, &what)
    }

    fn try_apfs(&self, offset: u64, length: u64, via: DiscoveryPath) -> Result<Option<MacOsInstallation>> {
        let uuid = apfs_container_uuid(&self.stream, offset)
            .ok_or_else(|| DiscoveryError::Filesystem("unreadable APFS container uuid".to_string()))?;
        let orchestrator = ApfsVolumeOrchestrator::new(
            self.apfs,
            &self.options.output_dir,
            self.options.credential.as_ref(),
            self.options.decrypt_on_read,
            &self.options.firmlinks,
        );
        let Some(outcome) = orchestrator.process(Arc::clone(&self.stream), offset, length, uuid)? else {
            return Ok(None);
        };
        Ok(Some(
            MacOsInstallation::new(outcome.filesystem, via, offset, outcome.report)
                .with_credentials(self.options.credential.clone(), self.options.decrypt_on_read)
                .with_apfs(outcome.container, outcome.root_volume, outcome.roles, outcome.cache),
        ))
    }

    fn try_hfs(&self, offset: u64, via: DiscoveryPath) -> Result<Option<MacOsInstallation>> {
        let filesystem = MacFilesystem::Hfs(self.hfs.initialize(Arc::clone(&self.stream), offset)?);
        let Some(report) = validator::validate(&filesystem)? else {
            return Ok(None);
        };
        Ok(Some(
            MacOsInstallation::new(filesystem, via, offset, report)
                .with_credentials(self.options.credential.clone(), self.options.decrypt_on_read),
        ))
    }
}

/// Validate an already-mounted macOS root directory
#[instrument]
pub fn discover_mounted(root: &Path) -> Result<MacOsInstallation> {
    let filesystem = MacFilesystem::Mounted(MountedDirectory::new(root)?);
    match validator::validate(&filesystem)? {
        Some(report) => Ok(MacOsInstallation::new(filesystem, DiscoveryPath::Mounted, 0, report)),
        None => {
            warn!(root = %root.display(), "Mounted directory is not a macOS root");
            Err(DiscoveryError::NoMacOsFound)
        }
    }
}

// =============================================================================
// Artifact Plugins
// =============================================================================

/// Consumer of a validated installation
pub trait ArtifactPlugin {
    fn name(&self) -> &str;

    fn process(&mut self, installation: &MacOsInstallation) -> Result<()>;
}

/// Hand the installation to every plugin in turn; returns how many succeeded
pub fn run_plugins(installation: &MacOsInstallation, plugins: &mut [Box<dyn ArtifactPlugin>]) -> usize {
    let mut succeeded = 0;
    for plugin in plugins.iter_mut() {
        info!(plugin = plugin.name(), "Running artifact plugin");
        match plugin.process(installation) {
            Ok(()) => succeeded += 1,
            Err(e) => error!(plugin = plugin.name(), "Plugin failed: {}", e),
        }
    }
    succeeded
}
