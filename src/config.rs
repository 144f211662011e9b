use crate::env;
use crate::error::{Result, RootServiceError};
use crate::launcher::{Elevation, LaunchBinary, Launcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client runtime settings, from `$ROOTSVC_CONFIG_DIR/config.toml` plus env overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Package whose services may be bound (e.g., "io.example.app")
    pub package: Option<String>,
    /// How the privileged shell is obtained
    pub elevation: Elevation,
    /// "self", "app_process", "staged" or an absolute path
    pub launch_binary: Option<String>,
    /// Helper executable to stage; defaults to this binary
    pub payload: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    /// Owner for the staged payload, e.g. "shell:shell"
    pub staging_owner: Option<String>,
    pub broadcast_dir: Option<PathBuf>,
    pub service_dir: Option<PathBuf>,
    /// Platform API level; selects debugger flags
    pub api_level: Option<u32>,
    pub verbose: Option<bool>,
    pub handshake_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub shell_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            package: None,
            elevation: if cfg!(target_os = "android") {
                Elevation::Root
            } else {
                Elevation::Sudo
            },
            launch_binary: None,
            payload: None,
            cache_dir: None,
            staging_dir: None,
            staging_owner: None,
            broadcast_dir: None,
            service_dir: None,
            api_level: None,
            verbose: None,
            handshake_timeout_secs: 20,
            stop_timeout_secs: 5,
            shell_timeout_secs: 30,
        }
    }
}

fn config_error(path: &Path, what: &str, e: impl std::fmt::Display) -> RootServiceError {
    RootServiceError::Config(format!("failed to {what} {}: {e}", path.display()))
}

impl RuntimeConfig {
    /// $ROOTSVC_CONFIG_DIR/config.toml or ~/.config/rootsvc/config.toml
    pub fn config_path() -> PathBuf {
        env::config_dir().join("config.toml")
    }

    /// Loads the default file (if any) and applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading runtime config");
        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| config_error(path, "read", e))?;
        let config: Self = toml::from_str(&content).map_err(|e| config_error(path, "parse", e))?;
        tracing::trace!(package = ?config.package, elevation = ?config.elevation, "Runtime config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| config_error(parent, "create", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RootServiceError::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path, content).map_err(|e| config_error(path, "write", e))?;
        tracing::trace!(path = %path.display(), "Runtime config saved");
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Some(package) = env::package_override() {
            self.package = Some(package);
        }
        if let Some(elevation) = env::elevation_override() {
            match elevation.parse() {
                Ok(e) => self.elevation = e,
                Err(e) => tracing::warn!(error = %e, "Ignoring {}", env::ELEVATION_ENV),
            }
        }
        if let Some(dir) = env::env_opt(env::BROADCAST_DIR_ENV) {
            self.broadcast_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env::env_opt(env::SERVICE_DIR_ENV) {
            self.service_dir = Some(PathBuf::from(dir));
        }
        if env::verbose_logging() {
            self.verbose = Some(true);
        }
    }

    pub fn package(&self) -> Result<&str> {
        self.package
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                RootServiceError::Config(format!(
                    "no package configured; set `package` in config.toml or {}",
                    env::PACKAGE_ENV
                ))
            })
    }

    pub fn launch_binary(&self) -> Option<LaunchBinary> {
        self.launch_binary.as_deref().map(|b| match b {
            "self" => LaunchBinary::SelfExe,
            "app_process" => LaunchBinary::AppProcess,
            "staged" => LaunchBinary::Staged,
            path => LaunchBinary::Custom(PathBuf::from(path)),
        })
    }

    pub fn broadcast_dir(&self) -> PathBuf {
        self.broadcast_dir.clone().unwrap_or_else(env::broadcast_dir)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    /// Builds the launcher for this configuration.
    pub fn launcher(&self) -> Result<Launcher> {
        let payload = match &self.payload {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let mut launcher = Launcher::new(self.package()?, payload);
        launcher.elevation = self.elevation;
        launcher.binary = self.launch_binary();
        if let Some(dir) = &self.cache_dir {
            launcher.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.staging_dir {
            launcher.staging_dir = dir.clone();
        }
        if self.staging_owner.is_some() {
            launcher.staging_owner = self.staging_owner.clone();
        }
        launcher.broadcast_dir = self.broadcast_dir();
        if let Some(dir) = &self.service_dir {
            launcher.service_dir = dir.clone();
        }
        if let Some(level) = self.api_level {
            launcher.api_level = level;
        }
        if let Some(verbose) = self.verbose {
            launcher.verbose = verbose;
        }
        Ok(launcher)
    }
}
