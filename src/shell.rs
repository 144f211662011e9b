use crate::error::LaunchError;
use crate::launcher::{Elevation, LaunchTask};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs launch tasks against a freshly spawned elevated shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ShellRunner {
    pub fn for_elevation(elevation: Elevation) -> Self {
        match elevation {
            Elevation::Root => Self::custom("su", Vec::<String>::new()),
            Elevation::Sudo => Self::custom("sudo", ["-n", "sh"]),
            Elevation::Adb => Self::custom("sh", Vec::<String>::new()),
        }
    }

    pub fn custom<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_SHELL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Writes the task to the shell's stdin, closes it and waits for the shell to exit.
    pub async fn run(&self, task: &LaunchTask) -> Result<(), LaunchError> {
        debug!(shell = %self.program, action = %task.action(), component = %task.component(), "Running launch task");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Io("shell stdin unavailable".to_string()))?;
        task.run(&mut stdin).await?;
        drop(stdin);

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(shell = %self.program, timeout = ?self.timeout, "Shell did not exit");
                return Err(LaunchError::ShellTimeout(self.timeout));
            }
        };
        if status.success() {
            Ok(())
        } else {
            Err(LaunchError::ShellFailed(status.code().unwrap_or(-1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::ComponentName;
    use crate::launcher::{LaunchAction, Launcher};

    fn task(dir: &std::path::Path) -> LaunchTask {
        let payload = dir.join("payload");
        std::fs::write(&payload, b"x").unwrap();
        let mut launcher = Launcher::new("io.example", payload);
        launcher.cache_dir = dir.join("cache");
        launcher.debugger = Some(false);
        launcher.task(&ComponentName::new("io.example", ".Svc"), LaunchAction::StartService)
    }

    #[tokio::test]
    async fn test_shell_consumes_line() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::custom("sh", ["-c", "cat >/dev/null"]);
        runner.run(&task(dir.path())).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::custom("sh", ["-c", "cat >/dev/null; exit 3"]);
        assert_eq!(
            runner.run(&task(dir.path())).await.unwrap_err(),
            LaunchError::ShellFailed(3)
        );
    }

    #[tokio::test]
    async fn test_hung_shell_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::custom("sh", ["-c", "cat >/dev/null; sleep 5"])
            .with_timeout(Duration::from_millis(50));
        assert!(matches!(
            runner.run(&task(dir.path())).await.unwrap_err(),
            LaunchError::ShellTimeout(_)
        ));
    }
}
