//! Per-container volume metadata cache
//!
//! One SQLite file per APFS container, named `APFS_Volumes_<UUID>.db` in the
//! output directory. It records which volume holds which role, the volume
//! identifiers and any derived key material so a re-run on the same
//! evidence skips volume indexing and key derivation. Decoders persist their
//! per-volume index in the same file (see [`VolumeCache::store_index_entry`])
//! and reload it when a later run skips indexing.
//!
//! A cache is reused only when it matches the live container exactly;
//! anything else (schema change, different volume set, changed role, missing
//! key, unreadable file) deletes the file and starts over. Records are never
//! patched in place.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{KeyMaterial, VolumeHandle, VolumeRole};
use crate::error::{DiscoveryError, Result};

/// Bumped whenever the table layout or the meaning of a column changes
pub const CACHE_SCHEMA_VERSION: u32 = 1;

pub fn cache_file_name(container_uuid: &Uuid) -> String {
    format!("APFS_Volumes_{}.db", container_uuid.to_string().to_uppercase())
}

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CachedVolume {
    pub slot: u32,
    pub name: String,
    pub role: VolumeRole,
    pub identifier: Uuid,
    pub encrypted: bool,
    pub key_material: Option<KeyMaterial>,
    pub indexed_records: u64,
}

impl CachedVolume {
    pub fn from_handle(volume: &VolumeHandle, key_material: Option<KeyMaterial>, indexed_records: u64) -> Self {
        Self {
            slot: volume.index,
            name: volume.name.clone(),
            role: volume.role,
            identifier: volume.identifier,
            encrypted: volume.encrypted,
            key_material,
            indexed_records,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub schema_version: u32,
    pub container_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub volumes: Vec<CachedVolume>,
}

impl CacheRecord {
    pub fn new(container_uuid: Uuid, volumes: Vec<CachedVolume>) -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            container_uuid,
            created_at: Utc::now(),
            volumes,
        }
    }

    pub fn volume(&self, identifier: &Uuid) -> Option<&CachedVolume> {
        self.volumes.iter().find(|v| &v.identifier == identifier)
    }

    /// Confirm this record describes `live` exactly
    pub fn check(&self, container_uuid: &Uuid, live: &[VolumeHandle], decrypt_on_read: bool) -> Result<()> {
        let invalid = |reason: String| Err(DiscoveryError::CacheInvalid(reason));

        if self.schema_version != CACHE_SCHEMA_VERSION {
            return invalid(format!(
                "schema version {} (expected {})",
                self.schema_version, CACHE_SCHEMA_VERSION
            ));
        }
        if &self.container_uuid != container_uuid {
            return invalid(format!("recorded for container {}", self.container_uuid));
        }
        if self.volumes.len() != live.len() {
            return invalid(format!("{} volumes recorded, {} present", self.volumes.len(), live.len()));
        }
        for volume in live {
            let Some(cached) = self.volume(&volume.identifier) else {
                return invalid(format!("volume {} ({}) not recorded", volume.name, volume.identifier));
            };
            if cached.role != volume.role {
                return invalid(format!(
                    "volume {} recorded as {}, now {}",
                    volume.identifier, cached.role, volume.role
                ));
            }
            if volume.encrypted && decrypt_on_read && cached.key_material.is_none() {
                return invalid(format!("no key material for encrypted volume {}", volume.name));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Single-writer guard
// ============================================================================

fn open_caches() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashSet::new()))
}

fn setup_error(path: &Path, err: impl fmt::Display) -> DiscoveryError {
    DiscoveryError::CacheSetup {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Exclusive claim on one cache path for the life of a [`VolumeCache`]
struct CacheLease {
    path: PathBuf,
}

impl CacheLease {
    fn acquire(path: &Path) -> Result<Self> {
        let key = std::path::absolute(path).map_err(|e| setup_error(path, e))?;
        let mut open = open_caches().lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(key.clone()) {
            return Err(DiscoveryError::CacheBusy(path.to_path_buf()));
        }
        Ok(Self { path: key })
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut open = open_caches().lock().unwrap_or_else(|e| e.into_inner());
        open.remove(&self.path);
    }
}

// ============================================================================
// Cache Store
// ============================================================================

/// An open, exclusively held cache file
pub struct VolumeCache {
    path: PathBuf,
    conn: Connection,
    /// Current record: loaded on open when valid, else the last one written
    record: Option<CacheRecord>,
    reused: bool,
    _lease: CacheLease,
}

impl VolumeCache {
    fn connect(path: PathBuf, lease: CacheLease, record: Option<CacheRecord>) -> Result<Self> {
        let conn = Connection::open(&path).map_err(|e| setup_error(&path, e))?;
        let cache = Self {
            path,
            conn,
            reused: record.is_some(),
            record,
            _lease: lease,
        };
        cache.init_schema().map_err(|e| setup_error(&cache.path, e))?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS volumes (
                slot INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                identifier TEXT NOT NULL UNIQUE,
                encrypted INTEGER NOT NULL,
                key_material TEXT,
                indexed_records INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS volume_index (
                identifier TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (identifier, key)
            );
        "#,
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> Option<&CacheRecord> {
        self.record.as_ref()
    }

    /// True when a valid record was found on open
    pub fn is_hit(&self) -> bool {
        self.reused
    }

    /// Raw connection for decoders that keep their own tables
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Save one piece of a volume's index under `key`, replacing any previous value
    pub fn store_index_entry(&self, volume: &Uuid, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO volume_index (identifier, key, value) VALUES (?1, ?2, ?3)",
            params![volume.to_string(), key, value],
        )?;
        Ok(())
    }

    pub fn index_entry(&self, volume: &Uuid, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM volume_index WHERE identifier = ?1 AND key = ?2",
                params![volume.to_string(), key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn index_entry_count(&self, volume: &Uuid) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM volume_index WHERE identifier = ?1",
            params![volume.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Read whatever record the file currently holds
    pub fn read_record(&self) -> Result<Option<CacheRecord>> {
        read_record(&self.conn)
    }

    /// Replace the stored record with `record`
    ///
    /// Failures are `CacheSetup` errors: a cache that cannot be written
    /// stops the run.
    pub fn write_record(&mut self, record: &CacheRecord) -> Result<()> {
        self.try_write_record(record).map_err(|e| setup_error(&self.path, e))?;
        debug!(path = %self.path.display(), volumes = record.volumes.len(), "Wrote metadata cache");
        self.record = Some(record.clone());
        Ok(())
    }

    fn try_write_record(&mut self, record: &CacheRecord) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM meta", [])?;
        tx.execute("DELETE FROM volumes", [])?;

        let mut meta = tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
        meta.execute(params!["schema_version", record.schema_version.to_string()])?;
        meta.execute(params!["container_uuid", record.container_uuid.to_string()])?;
        meta.execute(params!["created_at", record.created_at.to_rfc3339()])?;
        drop(meta);

        let mut insert = tx.prepare(
            "INSERT INTO volumes (slot, name, role, identifier, encrypted, key_material, indexed_records)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for volume in &record.volumes {
            insert.execute(params![
                volume.slot,
                volume.name,
                volume.role.as_str(),
                volume.identifier.to_string(),
                volume.encrypted,
                volume.key_material.as_ref().map(KeyMaterial::to_hex),
                volume.indexed_records as i64,
            ])?;
        }
        drop(insert);
        tx.commit()
    }

    /// Flush and release the file
    pub fn close(self) -> Result<()> {
        let VolumeCache { conn, .. } = self;
        conn.close().map_err(|(_, e)| DiscoveryError::from(e))
    }
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?)
}

fn read_record(conn: &Connection) -> Result<Option<CacheRecord>> {
    let (Some(version), Some(uuid), Some(created)) = (
        read_meta(conn, "schema_version")?,
        read_meta(conn, "container_uuid")?,
        read_meta(conn, "created_at")?,
    ) else {
        return Ok(None);
    };

    let schema_version = version
        .parse::<u32>()
        .map_err(|_| DiscoveryError::CacheInvalid(format!("bad schema version '{}'", version)))?;
    let container_uuid = parse_uuid(&uuid)?;
    let created_at = DateTime::parse_from_rfc3339(&created)
        .map_err(|e| DiscoveryError::CacheInvalid(format!("bad timestamp: {}", e)))?
        .with_timezone(&Utc);

    let mut stmt = conn.prepare(
        "SELECT slot, name, role, identifier, encrypted, key_material, indexed_records
         FROM volumes ORDER BY slot",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;

    let mut volumes = Vec::new();
    for row in rows {
        let (slot, name, role, identifier, encrypted, key, indexed) = row?;
        volumes.push(CachedVolume {
            slot,
            name,
            role: role.parse()?,
            identifier: parse_uuid(&identifier)?,
            encrypted,
            key_material: key.as_deref().map(KeyMaterial::from_hex).transpose()?,
            indexed_records: indexed.max(0) as u64,
        });
    }

    Ok(Some(CacheRecord {
        schema_version,
        container_uuid,
        created_at,
        volumes,
    }))
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| DiscoveryError::CacheInvalid(format!("bad uuid '{}': {}", text, e)))
}

/// Load the record at `path` and confirm it matches the live container
fn load_valid(path: &Path, container_uuid: &Uuid, live: &[VolumeHandle], decrypt_on_read: bool) -> Result<CacheRecord> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    let record = read_record(&conn)?.ok_or_else(|| DiscoveryError::CacheInvalid("no record".to_string()))?;
    record.check(container_uuid, live, decrypt_on_read)?;
    Ok(record)
}

/// Open the container's cache in `output_dir`, rebuilding it when stale
///
/// The returned cache either carries a validated [`CacheRecord`] (hit) or is
/// empty and waiting for [`VolumeCache::write_record`] (miss). A second open
/// of the same file while the first is alive fails with `CacheBusy`.
#[instrument(skip(live))]
pub fn ensure_valid_cache(
    output_dir: &Path,
    container_uuid: &Uuid,
    live: &[VolumeHandle],
    decrypt_on_read: bool,
) -> Result<VolumeCache> {
    let path = output_dir.join(cache_file_name(container_uuid));
    let lease = CacheLease::acquire(&path)?;

    if path.exists() {
        match load_valid(&path, container_uuid, live, decrypt_on_read) {
            Ok(record) => {
                info!(path = %path.display(), "Reusing volume metadata cache");
                return VolumeCache::connect(path, lease, Some(record));
            }
            Err(e) => {
                warn!(path = %path.display(), "Discarding stale metadata cache: {}", e);
                fs::remove_file(&path).map_err(|e| setup_error(&path, e))?;
            }
        }
    }

    debug!(path = %path.display(), "Creating volume metadata cache");
    VolumeCache::connect(path, lease, None)
}
