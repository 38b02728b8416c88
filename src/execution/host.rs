//! Process host - the boundary where command text becomes a subprocess

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Most output kept per stream, counted from the end
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Time a stopped process group gets between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// A command ready to hand to a host
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Command text, interpreted only by the shell
    pub command: String,

    /// Variables set on the subprocess on top of the inherited environment
    pub env: BTreeMap<String, String>,

    pub working_dir: PathBuf,
}

/// What a finished process reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutput {
    /// None when the process was terminated by a signal or stopped
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Executes command text. Timeouts and retries are the caller's concern.
///
/// Once `stop` is cancelled the host must terminate everything the command
/// started and return promptly. Dropping the returned future must also stop
/// the process.
#[async_trait]
pub trait CommandHost: Send + Sync {
    async fn execute(
        &self,
        invocation: &Invocation,
        stop: &CancellationToken,
    ) -> Result<HostOutput, HostError>;
}

/// Runs commands through the platform shell
///
/// Every command runs in its own process group, so stopping it also stops
/// whatever the script started.
#[derive(Debug, Clone)]
pub struct ShellHost {
    /// Shell executable
    shell: String,

    /// Flag that makes the shell read the command from its argument
    flag: String,

    stop_grace: Duration,
}

impl Default for ShellHost {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("cmd", "/C")
        } else {
            Self::new("sh", "-c")
        }
    }
}

impl ShellHost {
    /// Create a host for a specific shell, e.g. `("bash", "-c")`
    pub fn new(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Build the process for an invocation
    pub(crate) fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.flag)
            .arg(&invocation.command)
            .envs(&invocation.env)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandHost for ShellHost {
    async fn execute(
        &self,
        invocation: &Invocation,
        stop: &CancellationToken,
    ) -> Result<HostOutput, HostError> {
        debug!(
            "Spawning {} in {} ({} bytes of command text)",
            self.shell,
            invocation.working_dir.display(),
            invocation.command.len()
        );

        let started = Instant::now();
        let mut child = self
            .command(invocation)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .group_spawn()
            .map_err(|source| HostError::Spawn {
                program: self.shell.clone(),
                source,
            })?;
        let mut guard = GroupGuard::new(&mut child);

        let stdout = tokio::spawn(read_tail(child.inner().stdout.take()));
        let stderr = tokio::spawn(read_tail(child.inner().stderr.take()));

        let waited = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            status = child.inner().wait() => Some(status),
        };

        let exit_code = match waited {
            Some(status) => status.map_err(HostError::Wait)?.code(),
            None => {
                debug!("Stopping process group of {}", self.shell);
                terminate_group(&mut child, self.stop_grace).await;
                None
            }
        };
        guard.disarm();
        let duration = started.elapsed();

        if exit_code.is_none() {
            warn!("Process terminated without an exit code");
        }

        Ok(HostOutput {
            exit_code,
            stdout: stdout.await.unwrap_or_default().into_string(),
            stderr: stderr.await.unwrap_or_default().into_string(),
            duration,
        })
    }
}

/// The last [`MAX_CAPTURE_BYTES`] of a stream, plus how much was dropped
#[derive(Debug, Default)]
pub struct TailBuffer {
    bytes: Vec<u8>,
    dropped: usize,
}

impl TailBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        // Compact lazily so each byte is moved at most a couple of times
        if self.bytes.len() > 2 * MAX_CAPTURE_BYTES {
            let excess = self.bytes.len() - MAX_CAPTURE_BYTES;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
    }

    /// Decode the tail, noting truncation when anything was dropped
    pub fn into_string(mut self) -> String {
        if self.bytes.len() > MAX_CAPTURE_BYTES {
            let excess = self.bytes.len() - MAX_CAPTURE_BYTES;
            self.bytes.drain(..excess);
            self.dropped += excess;
        }
        if self.dropped == 0 {
            return String::from_utf8_lossy(&self.bytes).into_owned();
        }
        format!(
            "[{} bytes truncated]\n{}",
            self.dropped,
            String::from_utf8_lossy(&self.bytes)
        )
    }
}

async fn read_tail<R: AsyncRead + Unpin>(stream: Option<R>) -> TailBuffer {
    let mut tail = TailBuffer::default();
    let Some(mut stream) = stream else {
        return tail;
    };
    let mut chunk = vec![0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                warn!("Error reading process output: {}", e);
                break;
            }
        }
    }
    tail
}

/// Kills the process group if the host future is dropped mid-run
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(child: &mut AsyncGroupChild) -> Self {
        Self {
            pid: child.inner().id(),
        }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_group_now(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group_now(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_group_now(_pid: u32) {
    // kill_on_drop on the leader and the job object cover this
}

/// Stop a process group: SIGTERM, a grace period, then SIGKILL, then reap.
#[cfg(unix)]
pub(crate) async fn terminate_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("SIGTERM to process group {} failed: {}", pid, e),
    }

    let deadline = tokio::time::Instant::now() + grace;
    let mut reaped = false;
    while tokio::time::Instant::now() < deadline {
        if !reaped {
            reaped = matches!(child.inner().try_wait(), Ok(Some(_)));
        }
        if reaped && group_gone(pgid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("SIGKILL to process group {} failed: {}", pid, e),
    }
    if !reaped {
        let _ = child.inner().wait().await;
    }
}

/// True once no process in the group is left to signal
#[cfg(unix)]
fn group_gone(pgid: nix::unistd::Pid) -> bool {
    matches!(nix::sys::signal::killpg(pgid, None), Err(nix::errno::Errno::ESRCH))
}

#[cfg(not(unix))]
pub(crate) async fn terminate_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.inner().wait().await;
}
