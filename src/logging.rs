//! Subscriber setup: JSON events on stderr plus an optional size-rotated file sink.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG: &str = "SHIFTCHECK_LOG";
pub const ENV_LOG_DIR: &str = "SHIFTCHECK_LOG_DIR";
pub const ENV_LOG_MAX_SIZE_BYTES: &str = "SHIFTCHECK_LOG_MAX_SIZE_BYTES";
pub const ENV_LOG_MAX_FILES: &str = "SHIFTCHECK_LOG_MAX_FILES";

pub const DEFAULT_FILTER: &str = "shiftcheck=info,sqlx=warn";
pub const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 5;
pub const LOG_FILE_NAME: &str = "shiftcheck.log";

static FILE_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

fn env_filter() -> EnvFilter {
    let directives = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn env_usize(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(unix)]
fn rotating_file(path: &Path, max_bytes: usize, max_files: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(max_files),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    )
}

#[cfg(not(unix))]
fn rotating_file(path: &Path, max_bytes: usize, max_files: usize) -> FileRotate<AppendCount> {
    FileRotate::new(
        path,
        AppendCount::new(max_files),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
    )
}

/// Install the global subscriber. The file sink is added when
/// `SHIFTCHECK_LOG_DIR` is set. Safe to call more than once.
pub fn init_logging() {
    let file_layer = std::env::var_os(ENV_LOG_DIR)
        .map(PathBuf::from)
        .and_then(|dir| match file_writer(&dir) {
            Ok(writer) => Some(writer),
            Err(err) => {
                eprintln!("shiftcheck: file logging disabled: {err}");
                None
            }
        })
        .map(|writer| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer)
        });

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

fn file_writer(dir: &Path) -> std::io::Result<tracing_appender::non_blocking::NonBlocking> {
    std::fs::create_dir_all(dir)?;
    let max_bytes = env_usize(ENV_LOG_MAX_SIZE_BYTES, DEFAULT_MAX_SIZE_BYTES);
    let max_files = env_usize(ENV_LOG_MAX_FILES, DEFAULT_MAX_FILES);
    let rotate = rotating_file(&dir.join(LOG_FILE_NAME), max_bytes, max_files);
    let (writer, guard) = tracing_appender::non_blocking(rotate);
    if let Ok(mut slot) = FILE_GUARD.lock() {
        *slot = Some(guard);
    }
    Ok(writer)
}

/// Flush buffered file output. Call before the process exits.
pub fn flush_file_logs() {
    if let Ok(mut slot) = FILE_GUARD.lock() {
        slot.take();
    }
}
