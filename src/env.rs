use std::path::PathBuf;

// Environment variables understood by both the client and the privileged host.
pub const CONFIG_DIR_ENV: &str = "ROOTSVC_CONFIG_DIR";
pub const LOGGING_ENV: &str = "ROOTSVC_VERBOSE_LOGGING";
pub const DEBUG_ENV: &str = "ROOTSVC_DEBUGGER";
pub const CLASSPATH_ENV: &str = "CLASSPATH";
pub const BROADCAST_DIR_ENV: &str = "ROOTSVC_BROADCAST_DIR";
pub const CODE_PATH_ENV: &str = "ROOTSVC_CODE_PATH";
pub const SERVICE_DIR_ENV: &str = "ROOTSVC_SERVICE_DIR";
pub const PACKAGE_ENV: &str = "ROOTSVC_PACKAGE";
pub const ELEVATION_ENV: &str = "ROOTSVC_ELEVATION";

const APP_SUBDIR: &str = "rootsvc";
const FALLBACK_CONFIG_DIR: &str = "~/.config";

#[cfg(target_os = "android")]
pub const DEFAULT_STAGING_DIR: &str = "/data/local/tmp";
#[cfg(not(target_os = "android"))]
pub const DEFAULT_STAGING_DIR: &str = "/tmp";

/// Uid of the shell user on Android; allowed to deliver handshakes.
pub const SHELL_UID: u32 = 2000;
/// Uids are `user_id * PER_USER_RANGE + app_id`.
pub const PER_USER_RANGE: u32 = 100_000;

pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

pub fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Config directory ($ROOTSVC_CONFIG_DIR or ~/.config/rootsvc)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(APP_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// App-private cache directory (~/.cache/rootsvc)
pub fn cache_dir() -> PathBuf {
    let dir = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR))
        .join(APP_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved cache directory");
    dir
}

/// Verbose logging requested by the launching client ($ROOTSVC_VERBOSE_LOGGING)
pub fn verbose_logging() -> bool {
    let val = env_opt(LOGGING_ENV).is_some_and(|v| is_truthy(&v));
    tracing::trace!(value = val, "ROOTSVC_VERBOSE_LOGGING env var");
    val
}

/// Debugger hand-off requested by the launching client ($ROOTSVC_DEBUGGER)
pub fn debugger_requested() -> bool {
    env_opt(DEBUG_ENV).is_some_and(|v| is_truthy(&v))
}

/// Where handshake sockets live ($ROOTSVC_BROADCAST_DIR or <staging>/rootsvc/broadcast)
pub fn broadcast_dir() -> PathBuf {
    let path = env_opt(BROADCAST_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(DEFAULT_STAGING_DIR)
                .join(APP_SUBDIR)
                .join("broadcast")
        });
    tracing::trace!(path = %path.display(), "Broadcast directory");
    path
}

/// Where daemon hosts register their manager socket ($ROOTSVC_SERVICE_DIR)
pub fn service_dir() -> PathBuf {
    let path = env_opt(SERVICE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR).join(APP_SUBDIR));
    tracing::trace!(path = %path.display(), "Service directory");
    path
}

/// Code image of the hosting package ($ROOTSVC_CODE_PATH, else $CLASSPATH)
pub fn code_path() -> Option<PathBuf> {
    env_opt(CODE_PATH_ENV)
        .or_else(|| env_opt(CLASSPATH_ENV))
        .map(PathBuf::from)
}

pub fn package_override() -> Option<String> {
    env_opt(PACKAGE_ENV)
}

pub fn elevation_override() -> Option<String> {
    env_opt(ELEVATION_ENV)
}

pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

/// Root, the shell user, or ourselves: the only peers allowed to hand us capabilities.
pub fn privileged_peer(uid: u32) -> bool {
    uid == 0 || uid == SHELL_UID || uid == current_uid()
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// True when a tracer (debugger) is attached to this process.
pub fn debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_tracer_pid(&status))
        .is_some_and(|pid| pid != 0)
}

fn parse_tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|v| v.trim().parse().ok())
}
