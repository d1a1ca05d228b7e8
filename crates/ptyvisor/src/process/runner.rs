//! One-shot command execution with a hard timeout.

use std::ffi::OsStr;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use super::registry::ProcessRegistry;

/// Runs short-lived helper processes and captures their stdout.
///
/// Children are registered with the [`ProcessRegistry`] while they run and
/// are killed if they outlive their timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    registry: Arc<ProcessRegistry>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    /// Creates a runner that records children in the global registry.
    pub fn new() -> Self {
        Self::with_registry(ProcessRegistry::global())
    }

    /// Creates a runner that records children in `registry`.
    pub fn with_registry(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    /// Runs `executable` and returns its stdout.
    ///
    /// Returns `None` if the process cannot be spawned, exits with a non-zero
    /// status, or is still running after `timeout`.
    pub async fn run<I, S>(
        &self,
        executable: impl AsRef<OsStr>,
        args: I,
        timeout: Duration,
    ) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let executable = executable.as_ref();
        let mut child = match Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(executable = ?executable, error = %e, "Failed to spawn command");
                return None;
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(pid);
        }

        let output = tokio::time::timeout(timeout, collect_stdout(&mut child)).await;
        let result = match output {
            Ok(Ok((status, stdout))) if status.success() => {
                Some(String::from_utf8_lossy(&stdout).into_owned())
            }
            Ok(Ok((status, _))) => {
                tracing::debug!(executable = ?executable, status = %status, "Command failed");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(executable = ?executable, error = %e, "Command I/O failed");
                kill_child(&mut child).await;
                None
            }
            Err(_) => {
                tracing::warn!(
                    executable = ?executable,
                    timeout_ms = timeout.as_millis() as u64,
                    "Command timed out, killing it"
                );
                kill_child(&mut child).await;
                None
            }
        };

        if let Some(pid) = pid {
            self.registry.unregister(pid);
        }
        result
    }
}

/// Reads stdout while waiting for the child to exit.
///
/// Returns as soon as the child is reaped. A background grandchild may still
/// hold the pipe open, so only bytes already in the pipe are collected after
/// exit.
async fn collect_stdout(
    child: &mut Child,
) -> std::io::Result<(std::process::ExitStatus, Vec<u8>)> {
    let mut stdout = Vec::new();
    let Some(mut pipe) = child.stdout.take() else {
        let status = child.wait().await?;
        return Ok((status, stdout));
    };

    let mut chunk = [0u8; 4096];
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            read = pipe.read(&mut chunk) => match read? {
                0 => break child.wait().await?,
                n => stdout.extend_from_slice(&chunk[..n]),
            },
        }
    };

    drain_buffered(&pipe, &mut stdout);
    Ok((status, stdout))
}

/// Copies whatever the non-blocking pipe holds right now, without waiting.
fn drain_buffered(pipe: &ChildStdout, out: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match unistd::read(pipe.as_raw_fd(), &mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to drain command output");
                break;
            }
        }
    }
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill command");
    }
    let _ = child.wait().await;
}

/// Runs `executable` with the global registry. See [`CommandRunner::run`].
pub async fn run_command<I, S>(
    executable: impl AsRef<OsStr>,
    args: I,
    timeout: Duration,
) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    CommandRunner::new().run(executable, args, timeout).await
}
