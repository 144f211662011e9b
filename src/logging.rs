//! Subscriber setup for the two kinds of process this crate runs in.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const HOST_LOG_FILE: &str = "rootsvc-host.log";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Logs to stderr, filtered by `RUST_LOG`.
pub fn init_cli(verbose: bool) {
    let default = if verbose { "rootservice=debug,rootsvc=debug" } else { "warn" };
    let result = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter(default))
        .with_target(false)
        .try_init();
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

/// The host's stdio goes to `/dev/null`, so verbose hosts log to `<dir>/rootsvc-host.log`.
///
/// Returns the log path when file logging was enabled.
pub fn init_host(dir: &Path, verbose: bool) -> std::io::Result<Option<PathBuf>> {
    if !verbose {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(HOST_LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    // A second init in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_env_filter(filter("debug"))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init();
    tracing::info!(pid = std::process::id(), path = %path.display(), "Host logging started");
    Ok(Some(path))
}
