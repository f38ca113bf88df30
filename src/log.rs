//! Structured logging for arbor.
//!
//! Log levels follow the usual `tracing` meaning:
//! - ERROR: Failures that abort a session or worker
//! - WARN: Recoverable conditions (retries, best-effort cleanup failures)
//! - INFO: Session, worker and pool lifecycle
//! - DEBUG: Dispatch decisions and persistence traces
//! - TRACE: Prompts and executor payloads
//!
//! Debug mode can be enabled with `init_with_debug(true)` or the
//! `ARBOR_DEBUG=1` env var. `RUST_LOG` always wins when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

const DEFAULT_FILTER: &str = "arbor=info";
const DEBUG_FILTER: &str = "arbor=debug";

/// Initialize logging to ~/.arbor/arbor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug_enabled)));

    let writer = match open_log_file() {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if file logging was set up.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var("ARBOR_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    }
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".arbor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("arbor.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}
