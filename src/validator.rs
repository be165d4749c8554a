//! macOS installation check
//!
//! A root is accepted as macOS when it carries
//! `/System/Library/CoreServices/SystemVersion.plist`. Once accepted, the
//! kernel location, the OS version and the local user accounts are read from
//! it; none of those are required.

use std::collections::{BTreeSet, HashMap};

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{DiscoveryError, Result};
use crate::fs::FileSystem;

pub const SYSTEM_VERSION_PLIST: &str = "/System/Library/CoreServices/SystemVersion.plist";

/// Kernel locations, newest layout first
pub const KERNEL_PATHS: [&str; 2] = ["/System/Library/Kernels/kernel", "/mach_kernel"];

const USERS_DIR: &str = "/Users";
const DSLOCAL_USERS_DIR: &str = "/private/var/db/dslocal/nodes/Default/users";
const SYSTEM_ACCOUNTS: [&str; 3] = ["daemon", "nobody", "root"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub product_name: Option<String>,
    pub product_version: Option<String>,
    pub build_version: Option<String>,
}

/// What the validator learned about an accepted root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub system_info: Option<SystemInfo>,
    pub kernel_path: Option<String>,
    pub users: Vec<String>,
}

/// `Ok(None)` when `fs` is not a macOS root
#[instrument(skip(fs), fields(fs = %fs.describe()))]
pub fn validate(fs: &dyn FileSystem) -> Result<Option<ValidationReport>> {
    if !fs.is_file(SYSTEM_VERSION_PLIST) {
        debug!("No {} on candidate root", SYSTEM_VERSION_PLIST);
        return Ok(None);
    }

    let kernel_path = KERNEL_PATHS.iter().find(|p| fs.is_file(p)).map(|p| p.to_string());
    if kernel_path.is_none() {
        warn!("macOS root has no kernel at {}", KERNEL_PATHS.join(" or "));
    }

    let system_info = match fs.read_file(SYSTEM_VERSION_PLIST).and_then(|bytes| read_system_info(&bytes)) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Unreadable {}: {}", SYSTEM_VERSION_PLIST, e);
            None
        }
    };

    let users = local_users(fs);

    info!(
        version = system_info.as_ref().and_then(|s| s.product_version.as_deref()).unwrap_or("unknown"),
        build = system_info.as_ref().and_then(|s| s.build_version.as_deref()).unwrap_or("unknown"),
        users = users.len(),
        "Confirmed macOS installation on {}",
        fs.describe()
    );

    Ok(Some(ValidationReport {
        system_info,
        kernel_path,
        users,
    }))
}

/// Product name, version and build from an XML `SystemVersion.plist`
pub fn read_system_info(bytes: &[u8]) -> Result<SystemInfo> {
    if bytes.starts_with(b"bplist") {
        return Err(DiscoveryError::Filesystem("binary plist not supported".to_string()));
    }
    let strings = read_plist_strings(bytes)?;
    if strings.is_empty() {
        return Err(DiscoveryError::Filesystem("plist has no string values".to_string()));
    }
    Ok(SystemInfo {
        product_name: strings.get("ProductName").cloned(),
        product_version: strings.get("ProductVersion").cloned(),
        build_version: strings.get("ProductBuildVersion").cloned(),
    })
}

/// Top-level `<key>`/`<string>` pairs of an XML property list
fn read_plist_strings(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut values = HashMap::new();
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut dict_depth: Option<usize> = None;
    let mut current = String::new();
    let mut pending_key: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                current = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current == "dict" && dict_depth.is_none() {
                    dict_depth = Some(depth);
                }
                // Nested containers never hold the values we want
                if dict_depth.is_some_and(|d| depth > d + 1) {
                    pending_key = None;
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                current.clear();
            }
            Ok(Event::Text(ref e)) => {
                if dict_depth.map_or(true, |d| depth != d + 1) {
                    continue;
                }
                let text = e.unescape().unwrap_or_default().to_string();
                match current.as_str() {
                    "key" => pending_key = Some(text),
                    "string" => {
                        if let Some(key) = pending_key.take() {
                            values.insert(key, text);
                        }
                    }
                    _ => pending_key = None,
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DiscoveryError::Filesystem(format!(
                    "malformed plist at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(values)
}

/// Home directory names merged with local directory-service accounts
pub fn local_users(fs: &dyn FileSystem) -> Vec<String> {
    let mut users = BTreeSet::new();

    match fs.list_dir(USERS_DIR) {
        Ok(names) => users.extend(
            names
                .into_iter()
                .filter(|n| n != "Shared" && !n.starts_with('.'))
                .filter(|n| fs.is_dir(&format!("{}/{}", USERS_DIR, n))),
        ),
        Err(e) => debug!("Cannot list {}: {}", USERS_DIR, e),
    }

    match fs.list_dir(DSLOCAL_USERS_DIR) {
        Ok(names) => users.extend(names.into_iter().filter_map(|n| {
            let name = n.strip_suffix(".plist")?;
            if name.starts_with('_') || SYSTEM_ACCOUNTS.contains(&name) {
                None
            } else {
                Some(name.to_string())
            }
        })),
        Err(e) => debug!("Cannot list {}: {}", DSLOCAL_USERS_DIR, e),
    }

    users.into_iter().collect()
}
