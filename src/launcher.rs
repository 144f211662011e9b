//! Builds the shell line that starts a privileged host.
//!
//! The launcher only produces a [`LaunchTask`]; running it writes one line to an elevated
//! shell's stdin and returns. The spawned process detaches and reports back through a
//! handshake, never through the shell.

use crate::env;
use crate::error::LaunchError;
use crate::intent::ComponentName;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Entry point name the trampoline accepts for the host.
pub const HOST_ENTRY_POINT: &str = "rootservice.RootServiceHost";

/// File name of the helper payload in the cache and staging directories.
pub const PAYLOAD_NAME: &str = "rootsvc-main";

const API_27_DEBUG: &[&str] = &[
    "-Xrunjdwp:transport=dt_android_adb,suspend=n,server=y",
    "-Xcompiler-option",
    "--debuggable",
];
const API_28_DEBUG: &[&str] = &[
    "-XjdwpProvider:adbconnection",
    "-XjdwpOptions:suspend=n,server=y",
    "-Xcompiler-option",
    "--debuggable",
];

/// What the spawned host should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchAction {
    StartService,
    StartDaemon,
    StopServer,
}

impl LaunchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchAction::StartService => "startService",
            LaunchAction::StartDaemon => "startDaemon",
            LaunchAction::StopServer => "stopServer",
        }
    }

    /// Whether the action targets the daemon process slot.
    pub fn is_daemon(&self) -> bool {
        !matches!(self, LaunchAction::StartService)
    }

    pub fn start(daemon: bool) -> Self {
        if daemon {
            LaunchAction::StartDaemon
        } else {
            LaunchAction::StartService
        }
    }
}

impl fmt::Display for LaunchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LaunchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startService" => Ok(LaunchAction::StartService),
            "startDaemon" => Ok(LaunchAction::StartDaemon),
            "stopServer" => Ok(LaunchAction::StopServer),
            other => Err(other.to_string()),
        }
    }
}

/// Identity the elevated shell runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// `su` on a rooted device
    Root,
    /// ADB shell identity; cannot read app-private paths
    Adb,
    /// `sudo -n sh` on desktop Linux
    Sudo,
}

impl Elevation {
    /// Whether the elevated identity can read the app-private cache directory.
    pub fn reads_private_paths(&self) -> bool {
        !matches!(self, Elevation::Adb)
    }
}

impl FromStr for Elevation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "root" | "su" => Ok(Elevation::Root),
            "adb" | "shell" => Ok(Elevation::Adb),
            "sudo" => Ok(Elevation::Sudo),
            other => Err(format!("unknown elevation '{other}'")),
        }
    }
}

/// The binary the shell `exec`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchBinary {
    /// Platform process launcher matching the pointer width
    AppProcess,
    /// `/proc/<pid>/exe` of the calling process
    SelfExe,
    /// The staged payload
    Staged,
    Custom(PathBuf),
}

impl LaunchBinary {
    pub fn default_for(elevation: Elevation) -> Self {
        match elevation {
            // ADB cannot access `exe` of another process
            Elevation::Adb => LaunchBinary::Staged,
            Elevation::Root | Elevation::Sudo => LaunchBinary::SelfExe,
        }
    }

    fn resolve(&self, staged: &Path) -> PathBuf {
        match self {
            LaunchBinary::AppProcess => {
                if cfg!(target_pointer_width = "64") {
                    PathBuf::from("/system/bin/app_process64")
                } else {
                    PathBuf::from("/system/bin/app_process32")
                }
            }
            LaunchBinary::SelfExe => PathBuf::from(format!("/proc/{}/exe", env::current_pid())),
            LaunchBinary::Staged => staged.to_path_buf(),
            LaunchBinary::Custom(path) => path.clone(),
        }
    }
}

/// JDWP forwarding flags for the given API level, if debugging is supported there.
pub fn debug_params(api_level: u32) -> Option<&'static [&'static str]> {
    match api_level {
        0..=26 => None,
        27 => Some(API_27_DEBUG),
        _ => Some(API_28_DEBUG),
    }
}

/// Quote `arg` for POSIX `sh` if it contains anything but safe characters.
pub fn quote(arg: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
    }
}

/// Accumulates one shell command, quoting each word.
#[derive(Debug, Default, Clone)]
struct ShellLine {
    words: Vec<String>,
}

impl ShellLine {
    fn arg(&mut self, arg: impl AsRef<str>) -> &mut Self {
        self.words.push(quote(arg.as_ref()).into_owned());
        self
    }

    fn path(&mut self, path: &Path) -> &mut Self {
        self.arg(path.to_string_lossy())
    }

    fn env(&mut self, key: &str, value: impl AsRef<str>) -> &mut Self {
        self.words.push(format!("{key}={}", quote(value.as_ref())));
        self
    }

    /// Inserts shell syntax verbatim.
    fn raw(&mut self, token: &str) -> &mut Self {
        self.words.push(token.to_string());
        self
    }

    fn build(&self) -> String {
        self.words.join(" ")
    }
}

/// Static launch parameters for one client process.
#[derive(Debug, Clone)]
pub struct Launcher {
    pub package: String,
    pub uid: u32,
    pub elevation: Elevation,
    pub binary: Option<LaunchBinary>,
    /// Helper executable copied into the cache before each launch
    pub payload: PathBuf,
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Owner given to the staged payload, if any
    pub staging_owner: Option<String>,
    pub broadcast_dir: PathBuf,
    pub service_dir: PathBuf,
    pub code_path: Option<PathBuf>,
    pub api_level: u32,
    pub verbose: bool,
    /// Overrides tracer detection
    pub debugger: Option<bool>,
}

impl Launcher {
    pub fn new(package: impl Into<String>, payload: PathBuf) -> Self {
        Self {
            package: package.into(),
            uid: env::current_uid(),
            elevation: Elevation::Root,
            binary: None,
            payload,
            cache_dir: env::cache_dir(),
            staging_dir: PathBuf::from(env::DEFAULT_STAGING_DIR).join("rootsvc"),
            staging_owner: cfg!(target_os = "android").then(|| "shell:shell".to_string()),
            broadcast_dir: env::broadcast_dir(),
            service_dir: env::service_dir(),
            code_path: env::code_path(),
            api_level: 0,
            verbose: env::verbose_logging(),
            debugger: None,
        }
    }

    fn cached_payload(&self) -> PathBuf {
        self.cache_dir.join(PAYLOAD_NAME)
    }

    fn staged_payload(&self) -> PathBuf {
        self.staging_dir.join(PAYLOAD_NAME)
    }

    /// Builds the task that starts (or stops) a host for `component`.
    pub fn task(&self, component: &ComponentName, action: LaunchAction) -> LaunchTask {
        let cached = self.cached_payload();
        let staged = self.staged_payload();
        let debug = self.debugger.unwrap_or_else(env::debugger_attached)
            && debug_params(self.api_level).is_some();

        let mut line = ShellLine::default();
        line.raw("mkdir").raw("-p").path(&self.staging_dir);
        line.raw("&&").raw("cp").path(&cached).path(&self.staging_dir);
        line.raw("&&").raw("chmod").raw("755").path(&staged);
        if let Some(owner) = &self.staging_owner {
            line.raw("&&").raw("chown").arg(owner).path(&staged);
        }
        line.raw("&&").raw("(");

        if self.verbose {
            line.env(env::LOGGING_ENV, "1");
        }
        if debug {
            line.env(env::DEBUG_ENV, "1");
        }
        let classpath = if self.elevation.reads_private_paths() {
            &cached
        } else {
            &staged
        };
        line.env(env::CLASSPATH_ENV, classpath.to_string_lossy());
        line.env(env::BROADCAST_DIR_ENV, self.broadcast_dir.to_string_lossy());
        line.env(env::SERVICE_DIR_ENV, self.service_dir.to_string_lossy());
        if let Some(code_path) = &self.code_path {
            line.env(env::CODE_PATH_ENV, code_path.to_string_lossy());
        }

        let binary = self
            .binary
            .clone()
            .unwrap_or_else(|| LaunchBinary::default_for(self.elevation));
        line.raw("exec").path(&binary.resolve(&staged));
        if debug {
            for param in debug_params(self.api_level).unwrap_or_default() {
                line.arg(param);
            }
        }
        line.arg(format!("--nice-name={}:priv:{}", self.package, self.uid))
            .arg(HOST_ENTRY_POINT)
            .arg(component.flatten())
            .arg(self.uid.to_string())
            .arg(action.as_str());
        line.raw(">/dev/null").raw("2>&1").raw(")&");

        let command_line = line.build();
        trace!(%component, %action, "Built launch line");
        LaunchTask {
            component: component.clone(),
            action,
            payload: self.payload.clone(),
            cached,
            command_line,
        }
    }
}

/// A ready-to-run launch: stage the payload, then write one line to the shell.
#[derive(Debug, Clone)]
pub struct LaunchTask {
    component: ComponentName,
    action: LaunchAction,
    payload: PathBuf,
    cached: PathBuf,
    command_line: String,
}

impl LaunchTask {
    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn action(&self) -> LaunchAction {
        self.action
    }

    pub fn is_daemon(&self) -> bool {
        self.action.is_daemon()
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Copies the payload into the cache and writes the command to `stdin`.
    ///
    /// Does not wait for the spawned process; its output goes to `/dev/null`.
    pub async fn run<W>(&self, stdin: &mut W) -> Result<(), LaunchError>
    where
        W: AsyncWrite + Unpin,
    {
        self.stage_payload().await?;
        debug!(command = %self.command_line, "Writing launch command");
        stdin.write_all(self.command_line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn stage_payload(&self) -> Result<(), LaunchError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = self.cached.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Copying onto the running file fails with ETXTBSY; the cache copy is already current.
        if self.payload != self.cached {
            tokio::fs::copy(&self.payload, &self.cached).await?;
        }
        tokio::fs::set_permissions(&self.cached, std::fs::Permissions::from_mode(0o755)).await?;
        trace!(path = %self.cached.display(), "Payload staged");
        Ok(())
    }
}
