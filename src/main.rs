use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use mac_discover_lib::apfs::{ApfsContainer, ApfsDecoder, Credential};
use mac_discover_lib::config::{read_password_file, DiscoveryConfig};
use mac_discover_lib::partition::scan_partitions;
use mac_discover_lib::signature::{is_apfs_container, is_hfs_volume};
use mac_discover_lib::{
    discover_mounted, logging, ContainerFormat, ContainerStream, DecoderRegistry, DiscoveryController, DiscoveryError,
    FileSystem, HfsDecoder,
};

/// Locate the macOS installation inside a forensic evidence container
#[derive(Parser, Debug)]
#[command(name = "mac-discover", version, about)]
struct Args {
    /// Input type: DD, DMG, E01, AFF4, SPARSE, VMDK or MOUNTED
    input_type: String,

    /// Path to the evidence file (first segment for split images) or mount point
    input_path: PathBuf,

    /// Output directory for the APFS metadata caches
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Password or recovery key for encrypted APFS volumes
    #[arg(short, long, conflicts_with = "password_file")]
    password: Option<String>,

    /// File whose first line is the password or recovery key
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// Image was acquired already decrypted; do not unlock volumes
    #[arg(short = 'd', long)]
    dont_decrypt: bool,

    /// Configuration file (defaults to the per-user config.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the partition layout and filesystem signatures, then exit
    #[arg(long)]
    scan: bool,

    /// Log level: error, warn, info, debug or trace
    #[arg(short, long)]
    log_level: Option<String>,
}

/// Stand-in for the block-level decoders this binary does not link
struct UnlinkedDecoder;

impl ApfsDecoder for UnlinkedDecoder {
    fn open(
        &self,
        _stream: Arc<ContainerStream>,
        offset: u64,
        _length: u64,
    ) -> mac_discover_lib::Result<Box<dyn ApfsContainer>> {
        Err(DiscoveryError::UnsupportedFormat(format!(
            "APFS container at offset {} needs an APFS decoder",
            offset
        )))
    }
}

impl HfsDecoder for UnlinkedDecoder {
    fn initialize(&self, _stream: Arc<ContainerStream>, offset: u64) -> mac_discover_lib::Result<Box<dyn FileSystem>> {
        Err(DiscoveryError::UnsupportedFormat(format!(
            "HFS+ volume at offset {} needs an HFS+ decoder",
            offset
        )))
    }
}

fn credential(args: &Args) -> Result<Option<Credential>> {
    let secret = match (&args.password, &args.password_file) {
        (Some(password), _) => Some(password.clone()),
        (None, Some(path)) => Some(read_password_file(path)?),
        (None, None) => None,
    };
    Ok(secret.as_deref().map(Credential::from_secret))
}

fn scan(stream: &ContainerStream) -> Result<()> {
    println!("{}: {} bytes", stream.label(), stream.size()?);
    println!("APFS container at 0: {}", is_apfs_container(stream, 0));
    println!("HFS+ volume at 0:    {}", is_hfs_volume(stream, 0));
    match scan_partitions(stream) {
        Ok(table) => {
            println!("{}", serde_json::to_string_pretty(&table)?);
            for part in table.partitions.iter().filter(|p| p.is_allocated()) {
                println!(
                    "  {:>14} {:<32} apfs={} hfs={}",
                    part.start_offset,
                    part.description,
                    is_apfs_container(stream, part.start_offset),
                    is_hfs_volume(stream, part.start_offset)
                );
            }
        }
        Err(DiscoveryError::NoPartitionTable) => println!("No partition table"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn run_mounted(root: &Path) -> Result<()> {
    match discover_mounted(root) {
        Ok(installation) => {
            println!("{}", installation.summary());
            Ok(())
        }
        Err(DiscoveryError::NoMacOsFound) => {
            warn!("No macOS installation under {}", root.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_level.as_deref());

    if args.input_type.eq_ignore_ascii_case("MOUNTED") {
        return run_mounted(&args.input_path);
    }
    let format: ContainerFormat = args
        .input_type
        .parse()
        .with_context(|| format!("unknown input type '{}'", args.input_type))?;

    let mut config = DiscoveryConfig::load_or_default(args.config.as_deref())?;
    if let Some(output) = &args.output {
        config.output_path = Some(output.clone());
    }
    if args.dont_decrypt {
        config.decrypt_on_read = false;
    }
    let output_dir = config.output_dir();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

    let registry = DecoderRegistry::new().with_max_open_files(config.max_open_files);
    let stream = Arc::new(
        ContainerStream::open(format, &args.input_path, &registry)
            .with_context(|| format!("cannot open {} image {}", format, args.input_path.display()))?,
    );

    if args.scan {
        let scanned = scan(&stream);
        return finish(scanned, stream.close(), &args.input_path);
    }

    let options = config.to_options(credential(&args)?);
    let decoders = UnlinkedDecoder;
    let mut controller = DiscoveryController::new(Arc::clone(&stream), &decoders, &decoders, options);
    let outcome = controller.run();

    let result = match outcome {
        Ok(installation) => {
            println!("{}", installation.summary());
            if let Some(path) = installation.cache_path() {
                info!("Volume metadata cache: {}", path.display());
            }
            Ok(())
        }
        Err(DiscoveryError::NoMacOsFound) => {
            for failure in controller.failures() {
                warn!(offset = failure.offset, "{}: {}", failure.description, failure.error);
            }
            warn!("Could not find a macOS installation in {}", args.input_path.display());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("discovery aborted: {}", e)),
    };

    finish(result, stream.close(), &args.input_path)
}

/// The run's own result wins; a failed close is only logged
fn finish(result: Result<()>, closed: mac_discover_lib::Result<()>, input: &Path) -> Result<()> {
    if let Err(e) = closed {
        warn!("Failed to close {}: {}", input.display(), e);
    }
    result
}
