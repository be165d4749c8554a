//! In-memory fixtures shared by the unit tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::apfs::{ApfsContainer, ApfsDecoder, Credential, KeyMaterial, VolumeCache, VolumeHandle, VolumeRole};
use crate::error::{DiscoveryError, Result};
use crate::fs::{normalize_path, not_found, FileSystem, FsEntry};
use crate::hfs::HfsDecoder;
use crate::signature::APFS_PARTITION_TYPE;
use crate::stream::{ContainerDecoder, ContainerStream, MemoryDecoder};

pub const APFS_TYPE_GUID: [u8; 16] = APFS_PARTITION_TYPE;
/// C12A7328-F81F-11D2-BA4B-00A0C93EC93B
pub const EFI_TYPE_GUID: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];
/// 48465300-0000-11AA-AA11-00306543ECAC
pub const HFS_TYPE_GUID: [u8; 16] = [
    0x00, 0x53, 0x46, 0x48, 0x00, 0x00, 0xAA, 0x11, 0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
];

// =============================================================================
// Streams & images
// =============================================================================

pub fn memory_stream(data: Vec<u8>) -> Arc<ContainerStream> {
    Arc::new(ContainerStream::from_decoder("memory", Box::new(MemoryDecoder::new(data))))
}

/// Memory decoder that counts `close` calls
pub struct CountingDecoder {
    inner: MemoryDecoder,
    closes: Arc<AtomicUsize>,
}

impl CountingDecoder {
    pub fn new(data: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let decoder = Self {
            inner: MemoryDecoder::new(data),
            closes: Arc::clone(&closes),
        };
        (decoder, closes)
    }
}

impl ContainerDecoder for CountingDecoder {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn media_size(&self) -> u64 {
        self.inner.media_size()
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

pub struct GptPart {
    pub type_guid: [u8; 16],
    pub name: String,
    pub first_lba: u64,
    pub blocks: u64,
}

impl GptPart {
    pub fn new(type_guid: [u8; 16], name: &str, first_lba: u64, blocks: u64) -> Self {
        Self {
            type_guid,
            name: name.to_string(),
            first_lba,
            blocks,
        }
    }
}

/// 512-byte-sector disk with a protective MBR and a CRC-correct primary GPT
pub fn gpt_image(parts: &[GptPart], total_blocks: u64) -> Vec<u8> {
    const BLOCK: usize = 512;
    const ENTRIES: usize = 128;
    const ENTRY_SIZE: usize = 128;
    let mut image = vec![0u8; total_blocks as usize * BLOCK];

    image[446 + 4] = 0xEE;
    image[510] = 0x55;
    image[511] = 0xAA;

    let array_start = 2 * BLOCK;
    for (i, part) in parts.iter().enumerate() {
        let entry = &mut image[array_start + i * ENTRY_SIZE..array_start + (i + 1) * ENTRY_SIZE];
        entry[0..16].copy_from_slice(&part.type_guid);
        entry[16..32].copy_from_slice(&[i as u8 + 1; 16]);
        entry[32..40].copy_from_slice(&part.first_lba.to_le_bytes());
        entry[40..48].copy_from_slice(&(part.first_lba + part.blocks - 1).to_le_bytes());
        for (j, unit) in part.name.encode_utf16().take(36).enumerate() {
            entry[56 + j * 2..58 + j * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    let array_crc = crc32fast::hash(&image[array_start..array_start + ENTRIES * ENTRY_SIZE]);

    let header = &mut image[BLOCK..BLOCK + 92];
    header[0..8].copy_from_slice(b"EFI PART");
    header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    header[12..16].copy_from_slice(&92u32.to_le_bytes());
    header[24..32].copy_from_slice(&1u64.to_le_bytes());
    header[32..40].copy_from_slice(&(total_blocks - 1).to_le_bytes());
    header[40..48].copy_from_slice(&34u64.to_le_bytes());
    header[48..56].copy_from_slice(&(total_blocks - 34).to_le_bytes());
    header[56..72].copy_from_slice(&[0xD1; 16]);
    header[72..80].copy_from_slice(&2u64.to_le_bytes());
    header[80..84].copy_from_slice(&(ENTRIES as u32).to_le_bytes());
    header[84..88].copy_from_slice(&(ENTRY_SIZE as u32).to_le_bytes());
    header[88..92].copy_from_slice(&array_crc.to_le_bytes());
    let header_crc = crc32fast::hash(header);
    header[16..20].copy_from_slice(&header_crc.to_le_bytes());

    image
}

pub fn write_apfs_superblock(image: &mut [u8], offset: u64, uuid: Uuid) {
    let at = offset as usize;
    image[at + 0x20..at + 0x24].copy_from_slice(b"NXSB");
    image[at + 72..at + 88].copy_from_slice(uuid.as_bytes());
}

pub fn write_hfs_signature(image: &mut [u8], offset: u64) {
    let at = offset as usize + 0x400;
    image[at..at + 2].copy_from_slice(b"H+");
}

/// Container-only image: APFS superblock at offset 0
pub fn apfs_image(uuid: Uuid, size: usize) -> Vec<u8> {
    let mut image = vec![0u8; size];
    write_apfs_superblock(&mut image, 0, uuid);
    image
}

// =============================================================================
// Filesystems
// =============================================================================

/// Path-keyed in-memory filesystem
#[derive(Clone)]
pub struct MemoryFs {
    name: String,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl MemoryFs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_string()]),
        }
    }

    pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
        let path = normalize_path(path);
        if let Some(parent) = parent_of(&path) {
            self.add_dirs(&parent);
        }
        self.files.insert(path, contents.to_vec());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.add_dirs(&normalize_path(path));
        self
    }

    fn add_dirs(&mut self, path: &str) {
        let mut current = path.to_string();
        loop {
            self.dirs.insert(current.clone());
            match parent_of(&current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    let (parent, _) = path.rsplit_once('/')?;
    Some(if parent.is_empty() { "/".to_string() } else { parent.to_string() })
}

impl FileSystem for MemoryFs {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn lookup(&self, path: &str) -> Result<Option<FsEntry>> {
        let path = normalize_path(path);
        if let Some(contents) = self.files.get(&path) {
            return Ok(Some(FsEntry::file(contents.len() as u64)));
        }
        Ok(self.dirs.contains(&path).then(FsEntry::directory))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files.get(&normalize_path(path)).cloned().ok_or_else(|| not_found(path))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize_path(path);
        if !self.dirs.contains(&path) {
            return Err(not_found(&path));
        }
        let names: BTreeSet<String> = self
            .files
            .keys()
            .chain(self.dirs.iter())
            .filter(|p| parent_of(p).as_deref() == Some(path.as_str()))
            .filter_map(|p| p.rsplit('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }
}

pub fn system_version_plist(version: &str, build: &str) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>ProductBuildVersion</key>
	<string>{build}</string>
	<key>ProductCopyright</key>
	<string>1983-2023 Apple Inc.</string>
	<key>ProductName</key>
	<string>macOS</string>
	<key>ProductUserVisibleVersion</key>
	<string>{version}</string>
	<key>ProductVersion</key>
	<string>{version}</string>
</dict>
</plist>
"#
    )
    .into_bytes()
}

/// Read-only system volume of a 10.15 install
pub fn macos_system_fs() -> MemoryFs {
    MemoryFs::new("Macintosh HD")
        .with_file(
            "/System/Library/CoreServices/SystemVersion.plist",
            &system_version_plist("10.15.7", "19H2"),
        )
        .with_file("/System/Library/Kernels/kernel", b"\xcf\xfa\xed\xfe")
        .with_dir("/Users")
        .with_dir("/Applications")
}

/// Data volume holding one user
pub fn user_data_fs() -> MemoryFs {
    MemoryFs::new("Macintosh HD - Data")
        .with_file("/Users/alice/Documents/notes.txt", b"hello from data")
        .with_dir("/Users/Shared")
        .with_file("/private/var/db/dslocal/nodes/Default/users/alice.plist", b"bplist00")
        .with_file("/private/var/db/dslocal/nodes/Default/users/_mbsetupuser.plist", b"bplist00")
}

// =============================================================================
// Decoders
// =============================================================================

pub fn volume_handle(index: u32, name: &str, role: VolumeRole, encrypted: bool) -> VolumeHandle {
    VolumeHandle {
        name: name.to_string(),
        role,
        encrypted,
        identifier: Uuid::new_v4(),
        index,
        used_block_count: 1000,
        block_size: 4096,
        backing_database: None,
    }
}

#[derive(Clone)]
struct MockVolume {
    handle: VolumeHandle,
    fs: MemoryFs,
    password: Option<String>,
    keybag_unreadable: bool,
}

#[derive(Default)]
pub struct ApfsCalls {
    pub open: AtomicUsize,
    pub index_volume: AtomicUsize,
    pub derive_key: AtomicUsize,
}

/// APFS decoder serving fixed volumes; unlocks with a per-volume password
pub struct MockApfsDecoder {
    volumes: Vec<MockVolume>,
    pub calls: Arc<ApfsCalls>,
}

impl MockApfsDecoder {
    pub fn new() -> Self {
        Self {
            volumes: Vec::new(),
            calls: Arc::new(ApfsCalls::default()),
        }
    }

    pub fn with_volume(mut self, handle: VolumeHandle, fs: MemoryFs) -> Self {
        self.volumes.push(MockVolume {
            handle,
            fs,
            password: None,
            keybag_unreadable: false,
        });
        self
    }

    pub fn with_encrypted_volume(mut self, handle: VolumeHandle, fs: MemoryFs, password: &str) -> Self {
        self.volumes.push(MockVolume {
            handle,
            fs,
            password: Some(password.to_string()),
            keybag_unreadable: false,
        });
        self
    }

    /// Encrypted volume whose keybag block cannot be read from the image
    pub fn with_unreadable_keybag(mut self, handle: VolumeHandle, fs: MemoryFs) -> Self {
        self.volumes.push(MockVolume {
            handle,
            fs,
            password: None,
            keybag_unreadable: true,
        });
        self
    }
}

impl ApfsDecoder for MockApfsDecoder {
    fn open(&self, _stream: Arc<ContainerStream>, _offset: u64, _length: u64) -> Result<Box<dyn ApfsContainer>> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockApfsContainer {
            volumes: self.volumes.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockApfsContainer {
    volumes: Vec<MockVolume>,
    calls: Arc<ApfsCalls>,
}

impl MockApfsContainer {
    fn find(&self, volume: &VolumeHandle) -> Result<&MockVolume> {
        self.volumes
            .iter()
            .find(|v| v.handle.identifier == volume.identifier)
            .ok_or_else(|| DiscoveryError::Filesystem(format!("unknown volume {}", volume.name)))
    }
}

impl ApfsContainer for MockApfsContainer {
    fn volumes(&self) -> Result<Vec<VolumeHandle>> {
        Ok(self.volumes.iter().map(|v| v.handle.clone()).collect())
    }

    fn index_volume(&mut self, volume: &VolumeHandle, _key: Option<&KeyMaterial>, cache: &VolumeCache) -> Result<u64> {
        self.calls.index_volume.fetch_add(1, Ordering::SeqCst);
        let mock = self.find(volume)?;
        let count = (mock.fs.files.len() + mock.fs.dirs.len()) as u64;
        cache.store_index_entry(&volume.identifier, "records", &count.to_le_bytes())?;
        Ok(count)
    }

    fn derive_key(&mut self, volume: &VolumeHandle, credential: &Credential) -> Result<KeyMaterial> {
        self.calls.derive_key.fetch_add(1, Ordering::SeqCst);
        let mock = self.find(volume)?;
        if mock.keybag_unreadable {
            return Err(DiscoveryError::read(4096, 4096, "keybag block is unreadable"));
        }
        match &mock.password {
            Some(password) if password == credential.secret() => Ok(KeyMaterial::new(password.as_bytes().to_vec())),
            _ => Err(DiscoveryError::Decryption {
                volume: volume.name.clone(),
                reason: "wrong password".to_string(),
            }),
        }
    }

    fn open_volume(
        &mut self,
        volume: &VolumeHandle,
        key: Option<&KeyMaterial>,
        cache: &VolumeCache,
    ) -> Result<Box<dyn FileSystem>> {
        let mock = self.find(volume)?;
        if cache.index_entry(&volume.identifier, "records")?.is_none() {
            return Err(DiscoveryError::Filesystem(format!("volume {} not indexed", volume.name)));
        }
        if let (Some(key), Some(password)) = (key, &mock.password) {
            if key.as_bytes() != password.as_bytes() {
                return Err(DiscoveryError::Decryption {
                    volume: volume.name.clone(),
                    reason: "key does not unwrap volume".to_string(),
                });
            }
        }
        Ok(Box::new(mock.fs.clone()))
    }
}

/// HFS+ decoder serving volumes by start offset
pub struct MockHfsDecoder {
    volumes: HashMap<u64, MemoryFs>,
    initialized: Mutex<Vec<u64>>,
}

impl MockHfsDecoder {
    pub fn new() -> Self {
        Self {
            volumes: HashMap::new(),
            initialized: Mutex::new(Vec::new()),
        }
    }

    pub fn with_volume(mut self, offset: u64, fs: MemoryFs) -> Self {
        self.volumes.insert(offset, fs);
        self
    }

    pub fn initialized_offsets(&self) -> Vec<u64> {
        self.initialized.lock().unwrap().clone()
    }
}

impl HfsDecoder for MockHfsDecoder {
    fn initialize(&self, _stream: Arc<ContainerStream>, offset: u64) -> Result<Box<dyn FileSystem>> {
        self.initialized.lock().unwrap().push(offset);
        self.volumes
            .get(&offset)
            .cloned()
            .map(|fs| Box::new(fs) as Box<dyn FileSystem>)
            .ok_or_else(|| DiscoveryError::Filesystem(format!("no HFS+ volume at {}", offset)))
    }
}
