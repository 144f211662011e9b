use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Default code path poll interval
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    dev: u64,
    ino: u64,
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        dev: meta.dev(),
        ino: meta.ino(),
        len: meta.len(),
        mtime: meta.mtime(),
        mtime_nsec: meta.mtime_nsec(),
    })
}

/// Watches the hosting package's code image and fires once when it is replaced or removed.
pub struct CodePathObserver {
    path: PathBuf,
    check_interval: Duration,
}

impl CodePathObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Starts polling on `runtime`; `on_change` runs at most once.
    pub fn spawn<F>(self, runtime: &Handle, on_change: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let initial = fingerprint(&self.path);
        if initial.is_none() {
            warn!(path = %self.path.display(), "Code path does not exist; watching for it anyway");
        }
        info!(path = %self.path.display(), interval = ?self.check_interval, "Monitoring code path");

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let current = fingerprint(&self.path);
                if current != initial {
                    info!(path = %self.path.display(), "Code path changed");
                    on_change();
                    return;
                }
                debug!(path = %self.path.display(), "Code path unchanged");
            }
        });
        task.abort_handle()
    }
}
