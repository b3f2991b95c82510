use crate::error::HarnessError;
use std::path::PathBuf;
use tracing::warn;
#[cfg(unix)]
use {
    nix::errno::Errno,
    nix::fcntl::OFlag,
    nix::sys::stat::Mode,
    std::fs::OpenOptions,
    std::io::{ErrorKind, Write},
    std::os::unix::fs::OpenOptionsExt,
    std::path::Path,
    tokio::io::AsyncReadExt,
    tokio::net::unix::pipe,
    tracing::{debug, info},
};

/// Result of a resume attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// Nobody is reading the pipe yet (process still starting or not suspended)
    PipeNotReady,
}

/// Out-of-band resume path for a process blocked in a cooperative suspend.
pub trait ResumeChannel: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Writes the resume signal for the process `pid`.
    fn resume(&self, pid: u32) -> Result<ResumeOutcome, HarnessError>;
}

/// Picks the resume implementation for the running platform.
pub struct SuspendResumeChannel;

impl SuspendResumeChannel {
    #[cfg(unix)]
    pub fn detect(pipe_prefix: &str) -> Box<dyn ResumeChannel> {
        Box::new(NamedPipeResume::new(pipe_prefix))
    }

    #[cfg(not(unix))]
    pub fn detect(_pipe_prefix: &str) -> Box<dyn ResumeChannel> {
        warn!("Suspend/resume is not supported on this platform");
        Box::new(UnsupportedResume)
    }
}

/// Pipe path for a process: fixed prefix followed by the process id.
pub fn pipe_path(prefix: &str, pid: u32) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, pid))
}

/// Resume by writing a little-endian `1u32` into the process's named pipe.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct NamedPipeResume {
    prefix: String,
}

#[cfg(unix)]
impl NamedPipeResume {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }
}

#[cfg(unix)]
impl ResumeChannel for NamedPipeResume {
    fn is_supported(&self) -> bool {
        true
    }

    fn resume(&self, pid: u32) -> Result<ResumeOutcome, HarnessError> {
        let path = pipe_path(&self.prefix, pid);

        // Non-blocking open fails with ENXIO instead of waiting for a reader
        let mut pipe = match OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&path)
        {
            Ok(pipe) => pipe,
            Err(e) if e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                warn!("Resume pipe {:?} is not ready", path);
                return Ok(ResumeOutcome::PipeNotReady);
            }
            Err(e) => {
                return Err(HarnessError::SendFailed {
                    what: format!("resume signal to {:?}: {}", path, e),
                });
            }
        };

        pipe.write_all(&1u32.to_le_bytes()).map_err(|e| HarnessError::SendFailed {
            what: format!("resume signal to {:?}: {}", path, e),
        })?;

        info!("Sent resume signal to process {}", pid);
        Ok(ResumeOutcome::Resumed)
    }
}

/// Explicit stand-in where no named-pipe primitive exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedResume;

impl ResumeChannel for UnsupportedResume {
    fn is_supported(&self) -> bool {
        false
    }

    fn resume(&self, _pid: u32) -> Result<ResumeOutcome, HarnessError> {
        Err(HarnessError::SuspendUnsupported)
    }
}

/// Removes the FIFO when the wait ends, including when it is cancelled.
#[cfg(unix)]
struct FifoGuard(PathBuf);

#[cfg(unix)]
impl Drop for FifoGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove resume pipe {:?}: {}", self.0, e);
            }
        }
    }
}

/// Waits until a non-zero resume value arrives on `path`.
///
/// Creates the FIFO and reads 32-bit values until one is non-zero. The pipe
/// is read through the runtime, so dropping the future closes it and removes
/// the FIFO.
#[cfg(unix)]
pub async fn wait_for_resume(path: PathBuf) -> std::io::Result<()> {
    match nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(std::io::Error::from(e)),
    }
    let guard = FifoGuard(path);
    debug!("Waiting for resume on {:?}", guard.0);

    read_until_resumed(&guard.0).await
}

#[cfg(unix)]
async fn read_until_resumed(path: &Path) -> std::io::Result<()> {
    loop {
        // Reopened after every writer hangs up, which reads as EOF
        let mut pipe = pipe::OpenOptions::new().open_receiver(path)?;
        loop {
            let mut value = [0u8; 4];
            match pipe.read_exact(&mut value).await {
                Ok(_) if u32::from_le_bytes(value) != 0 => return Ok(()),
                Ok(_) => debug!("Ignoring zero resume value"),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_pipe_path_is_prefix_plus_pid() {
        assert_eq!(pipe_path("/tmp/netunit-suspend-", 4242), PathBuf::from("/tmp/netunit-suspend-4242"));
    }

    #[test]
    fn test_missing_pipe_is_not_ready() {
        let dir = tempdir().unwrap();
        let prefix = format!("{}/suspend-", dir.path().display());
        let channel = SuspendResumeChannel::detect(&prefix);

        assert!(channel.is_supported());
        assert_eq!(channel.resume(1234).unwrap(), ResumeOutcome::PipeNotReady);
    }

    #[test]
    fn test_unsupported_is_explicit() {
        let channel = UnsupportedResume;
        assert!(!channel.is_supported());
        assert_eq!(channel.resume(1), Err(HarnessError::SuspendUnsupported));
    }

    #[tokio::test]
    async fn test_resume_releases_waiter() {
        let dir = tempdir().unwrap();
        let prefix = format!("{}/suspend-", dir.path().display());
        let path = pipe_path(&prefix, 99);

        let waiter = tokio::spawn(wait_for_resume(path.clone()));
        let channel = NamedPipeResume::new(&prefix);

        let mut outcome = ResumeOutcome::PipeNotReady;
        for _ in 0..100 {
            outcome = channel.resume(99).unwrap();
            if outcome == ResumeOutcome::Resumed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(outcome, ResumeOutcome::Resumed);

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }

    async fn wait_for_fifo(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resume pipe {:?} never appeared", path);
    }

    #[tokio::test]
    async fn test_zero_value_keeps_waiting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suspend-7");
        let waiter = tokio::spawn(wait_for_resume(path.clone()));
        wait_for_fifo(&path).await;

        let mut writer = OpenOptions::new().write(true).custom_flags(OFlag::O_NONBLOCK.bits()).open(&path).unwrap();
        writer.write_all(&0u32.to_le_bytes()).unwrap();
        drop(writer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let channel = NamedPipeResume::new(&format!("{}/suspend-", dir.path().display()));
        let mut outcome = ResumeOutcome::PipeNotReady;
        for _ in 0..100 {
            outcome = channel.resume(7).unwrap();
            if outcome == ResumeOutcome::Resumed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outcome, ResumeOutcome::Resumed);
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_pipe() {
        let dir = tempdir().unwrap();
        let prefix = format!("{}/suspend-", dir.path().display());
        let path = pipe_path(&prefix, 31);

        let waiter = tokio::spawn(wait_for_resume(path.clone()));
        wait_for_fifo(&path).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        // No reader is left behind on the pipe
        assert!(!path.exists());
        assert_eq!(NamedPipeResume::new(&prefix).resume(31).unwrap(), ResumeOutcome::PipeNotReady);
    }
}
