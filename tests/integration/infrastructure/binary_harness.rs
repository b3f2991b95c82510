use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Runs the `netunit` binary against a generated configuration file.
pub struct NetunitBinary {
    binary: PathBuf,
    temp_dir: TempDir,
    child: Option<Child>,
}

impl NetunitBinary {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self { binary: PathBuf::from(env!("CARGO_BIN_EXE_netunit")), temp_dir, child: None })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.temp_dir.path().join("logs")
    }

    /// Writes `config` and starts the binary with session logs in the temp dir.
    pub fn spawn(&mut self, config: &str, args: &[&str]) -> Result<()> {
        let config_path = self.temp_dir.path().join("netunit.toml");
        std::fs::write(&config_path, config).context("Failed to write config")?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config")
            .arg(&config_path)
            .arg("--log-dir")
            .arg(self.log_dir())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);

        self.child = Some(cmd.spawn().context("Failed to spawn netunit")?);
        Ok(())
    }

    pub fn pid(&self) -> Option<Pid> {
        self.child.as_ref().and_then(Child::id).map(|id| Pid::from_raw(id as i32))
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid().context("netunit is not running")?;
        nix::sys::signal::kill(pid, signal)?;
        Ok(())
    }

    pub async fn wait_for_exit(&mut self, limit: Duration) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match timeout(limit, child.wait()).await {
            Ok(status) => Ok(Some(status.context("Process wait failed")?)),
            Err(_) => Ok(None),
        }
    }

    /// Contents of the first session's status log.
    pub fn status_log(&self) -> Result<String> {
        let path = session_status_log(&self.log_dir());
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))
    }
}

fn session_status_log(log_dir: &Path) -> PathBuf {
    log_dir.join("UnitTests").join("UnitTestStatus.log")
}
