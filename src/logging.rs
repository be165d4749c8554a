//! Logging and tracing configuration
//!
//! Structured logging through the `tracing` crate.
//!
//! # Usage
//!
//! Initialize logging once at startup:
//! ```rust,ignore
//! logging::init(None);
//! ```
//!
//! # Log Levels
//!
//! - `error` - A candidate or plugin failed
//! - `warn`  - Unexpected but recoverable (stale cache, missing kernel, NOT_FOUND)
//! - `info`  - Discovery progress (default in release)
//! - `debug` - State transitions, per-partition decisions (default in debug builds)
//! - `trace` - Individual reads and table entries
//!
//! # Environment Variable Control
//!
//! `RUST_LOG` overrides the default filter:
//! ```bash
//! RUST_LOG=debug mac-discover DD disk.dd
//! RUST_LOG=mac_discover_lib::partition=trace mac-discover E01 case.E01
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn default_filter(level: Option<&str>) -> EnvFilter {
    let level = level.unwrap_or(if cfg!(any(debug_assertions, feature = "debug-logging")) {
        "debug"
    } else {
        "info"
    });
    EnvFilter::new(format!("mac_discover={level},mac_discover_lib={level}"))
}

/// Initialize the logging/tracing system
///
/// `level` (from `--log-level`) replaces the build default; `RUST_LOG`
/// still wins when set.
pub fn init(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact(),
    );

    // Already set when a test or embedding application installed one
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with verbose output (file:line, thread IDs)
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Skip expensive debug-only formatting when nobody listens
#[inline]
pub fn is_debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}
