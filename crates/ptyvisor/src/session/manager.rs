//! Session manager owning one PTY-attached child process.
//!
//! A [`Session`] drives the lifecycle described in [`super::state`]:
//! `start()` allocates the PTY and spawns the child, a readiness-driven read
//! loop feeds the [`OutputPipeline`], and an exit watcher notices when the
//! child dies on its own. Explicit termination and spontaneous exit share one
//! cleanup path.
//!
//! # Ownership
//!
//! The PTY master, the child handle and the background tasks live in a single
//! slot that is emptied exactly once per run. Whichever path wins the
//! `Running -> Terminating` transition takes the slot and tears everything
//! down; every other caller finds nothing to do. Because the master is only
//! reachable through that slot, it is closed exactly once and never written
//! after it has been closed.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use nix::libc;
use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::Signal as SignalStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::SessionError;
use super::output::{OutputCallback, OutputHandlers, OutputPipeline, SharedBuffer};
use super::pty::{self, ChildProcess, ExitStatus, PtyMaster, PtyPair};
use super::state::{SessionState, StateMachine};
use crate::process::ProcessRegistry;

/// Default output buffer cap, in characters.
pub const DEFAULT_MAX_BUFFER_CHARS: usize = 50_000;

/// Default quiet period before the aggregate output callback fires.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(300);

/// Default number of bytes read from the PTY per readiness event.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default time a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 24;

/// Runtime configuration of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Output buffer cap, in characters.
    pub max_buffer_chars: usize,
    /// Quiet period before the aggregate output callback fires.
    pub debounce_interval: Duration,
    /// Bytes read per readiness event.
    pub read_chunk_size: usize,
    /// Time between SIGTERM and SIGKILL during teardown.
    pub grace_period: Duration,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: DEFAULT_MAX_BUFFER_CHARS,
            debounce_interval: DEFAULT_DEBOUNCE_INTERVAL,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            grace_period: DEFAULT_GRACE_PERIOD,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// What started a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// `terminate()` was called.
    Requested,
    /// The exit watcher saw the child die.
    ProcessExited,
}

/// Read-side view of the master handed to the reactor.
///
/// It never closes the descriptor: the last `Arc` does, and the session only
/// drops its own after the read loop has stopped.
struct ReadHandle(Arc<PtyMaster>);

impl AsRawFd for ReadHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Everything a running session owns.
struct Resources {
    master: Arc<PtyMaster>,
    child: Arc<ChildProcess>,
    pid: u32,
    reader: JoinHandle<()>,
    watcher: JoinHandle<()>,
    pipeline: OutputPipeline,
}

struct Inner {
    config: SessionConfig,
    state: StateMachine,
    /// Serializes start, reset and teardown.
    control: tokio::sync::Mutex<()>,
    resources: Mutex<Option<Resources>>,
    buffer: SharedBuffer,
    handlers: Mutex<OutputHandlers>,
    registry: Arc<ProcessRegistry>,
    last_exit: Mutex<Option<ExitStatus>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A PTY session.
///
/// `Session` is a cheap handle; clones refer to the same session. When the
/// last handle is dropped while the child is still running, the child is
/// killed and its resources are released.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.inner.state.current())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    /// Creates an uninitialized session that records its child in the
    /// global process registry.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_registry(config, ProcessRegistry::global())
    }

    /// Creates an uninitialized session using `registry`.
    pub fn with_registry(config: SessionConfig, registry: Arc<ProcessRegistry>) -> Self {
        let buffer = SharedBuffer::new(config.max_buffer_chars);
        Self {
            inner: Arc::new(Inner {
                config,
                state: StateMachine::new(),
                control: tokio::sync::Mutex::new(()),
                resources: Mutex::new(None),
                buffer,
                handlers: Mutex::new(OutputHandlers::default()),
                registry,
                last_exit: Mutex::new(None),
            }),
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Sets the callback receiving each decoded chunk.
    ///
    /// Takes effect on the next `start()`.
    pub fn set_output_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        let callback: OutputCallback = Arc::new(handler);
        lock(&self.inner.handlers).on_chunk = Some(callback);
    }

    /// Sets the callback receiving the whole buffer after a quiet period.
    ///
    /// Takes effect on the next `start()`.
    pub fn set_flush_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        let callback: OutputCallback = Arc::new(handler);
        lock(&self.inner.handlers).on_flush = Some(callback);
    }

    /// Spawns `executable` on a new PTY.
    ///
    /// `env` is layered over the current process environment. On success the
    /// session is `Running` and its read loop and exit watcher are active.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition` unless the session is `Uninitialized`.
    ///   Call [`reset`](Self::reset) after a previous run.
    /// - `ExecutableNotFound`, `PtyCreationFailed` or `SpawnFailed`, after
    ///   which the session is `Failed`.
    pub async fn start(
        &self,
        executable: impl AsRef<Path>,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), SessionError> {
        self.inner.start(executable.as_ref(), args, env).await
    }

    /// Writes `data` to the child's terminal.
    ///
    /// Returns the number of bytes accepted, or `-1` if the session is not
    /// running or the write failed.
    pub fn write(&self, data: &[u8]) -> isize {
        if !self.inner.state.inspect(SessionState::is_running) {
            tracing::debug!(len = data.len(), "Write rejected: session not running");
            return -1;
        }

        let slot = lock(&self.inner.resources);
        let Some(resources) = slot.as_ref() else {
            return -1;
        };
        match resources.master.write(data) {
            Ok(written) => written as isize,
            Err(e) => {
                tracing::debug!(pid = resources.pid, error = %e, "PTY write failed");
                -1
            }
        }
    }

    /// Changes the terminal window size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.inner.state.inspect(SessionState::is_running) {
            return Err(SessionError::NotRunning);
        }

        let slot = lock(&self.inner.resources);
        let resources = slot.as_ref().ok_or(SessionError::NotRunning)?;
        resources.master.resize(cols, rows).map_err(|e| {
            tracing::warn!(pid = resources.pid, cols, rows, error = %e, "PTY resize failed");
            SessionError::ResizeFailed {
                os_error_code: e.raw_os_error().unwrap_or(libc::EIO),
            }
        })?;
        tracing::debug!(pid = resources.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Stops the child and releases every resource of the current run.
    ///
    /// Idempotent: calling it when the session is not running, or
    /// concurrently from several tasks, does nothing beyond the first
    /// teardown.
    pub async fn terminate(&self) {
        self.inner.shutdown(Trigger::Requested).await;
    }

    /// Returns a finished session to `Uninitialized` so it can be started
    /// again.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless the session is `Terminated` or
    /// `Failed`.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let _control = self.inner.control.lock().await;
        self.inner.state.advance(SessionState::Uninitialized)?;
        Ok(())
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    /// Returns the child's pid while running.
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.inspect(SessionState::pid)
    }

    /// Returns true while the child is attached.
    pub fn is_running(&self) -> bool {
        self.inner.state.inspect(SessionState::is_running)
    }

    /// Returns a copy of the buffered output.
    pub fn output(&self) -> String {
        self.inner.buffer.snapshot()
    }

    /// Returns how the child of the last run ended, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *lock(&self.inner.last_exit)
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Calls `callback` for every state change, on a background task.
    ///
    /// The task ends when the session is dropped.
    pub fn on_state_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SessionState) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(state) => callback(state),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "State listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Inner {
    fn fail(&self, error: SessionError) -> Result<(), SessionError> {
        self.state.advance(SessionState::Failed {
            error: error.clone(),
        })?;
        Err(error)
    }

    async fn start(
        self: &Arc<Self>,
        executable: &Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(), SessionError> {
        let _control = self.control.lock().await;
        self.state.advance(SessionState::Starting)?;

        if !executable.is_file() {
            tracing::warn!(executable = %executable.display(), "Executable not found");
            return self.fail(SessionError::ExecutableNotFound {
                path: executable.to_path_buf(),
            });
        }

        self.buffer.lock().clear();
        *lock(&self.last_exit) = None;

        let pair = match pty::open_pty(self.config.cols, self.config.rows) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "Failed to allocate PTY");
                return self.fail(e);
            }
        };

        let spawned = pty::spawn_on_pty(&pair.slave, executable, args, env);
        let PtyPair { master, slave } = pair;
        drop(slave);
        let pid = match spawned {
            Ok(pid) => pid,
            Err(e) => {
                drop(master);
                return self.fail(e);
            }
        };

        let child = Arc::new(ChildProcess::new(pid));
        let master = Arc::new(master);
        let (read_fd, sigchld) = match prepare_io(&master) {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(pid = %pid, error = %e, "Failed to prepare session I/O");
                drop(master);
                stop_child(&child, self.config.grace_period).await;
                return self.fail(SessionError::SpawnFailed {
                    os_error_code: e.raw_os_error().unwrap_or(libc::EIO),
                });
            }
        };

        let pid = pid.as_raw() as u32;
        let master_fd = master.as_raw_fd();
        let handlers = lock(&self.handlers).clone();
        let pipeline =
            OutputPipeline::spawn(self.buffer.clone(), self.config.debounce_interval, handlers);
        let reader = tokio::spawn(read_loop(
            read_fd,
            pipeline.sender(),
            self.config.read_chunk_size,
        ));
        let watcher = tokio::spawn(watch_exit(
            Arc::downgrade(self),
            Arc::clone(&child),
            sigchld,
        ));

        *lock(&self.resources) = Some(Resources {
            master,
            child,
            pid,
            reader,
            watcher,
            pipeline,
        });

        if let Err(e) = self.state.advance(SessionState::Running { pid, master_fd }) {
            let taken = lock(&self.resources).take();
            if let Some(resources) = taken {
                self.release(resources, Trigger::Requested).await;
            }
            return Err(e);
        }
        self.registry.register(pid);

        tracing::info!(
            pid,
            master_fd,
            executable = %executable.display(),
            "Session running"
        );
        Ok(())
    }

    async fn shutdown(&self, trigger: Trigger) {
        let _control = self.control.lock().await;

        // Only the caller that moves Running -> Terminating owns the teardown.
        if self.state.advance(SessionState::Terminating).is_err() {
            tracing::debug!(
                trigger = ?trigger,
                state = %self.state.current(),
                "Nothing to tear down"
            );
            return;
        }

        let taken = lock(&self.resources).take();
        if let Some(resources) = taken {
            self.release(resources, trigger).await;
        }

        if let Err(e) = self.state.advance(SessionState::Terminated) {
            tracing::error!(error = %e, "Failed to finish teardown");
        }
    }

    async fn release(&self, resources: Resources, trigger: Trigger) {
        let Resources {
            master,
            child,
            pid,
            mut reader,
            watcher,
            pipeline,
        } = resources;

        tracing::debug!(pid, trigger = ?trigger, "Releasing session resources");

        // After a spontaneous exit the slave side is closed, so the read loop
        // drains what is left and stops on EIO.
        let drained = trigger == Trigger::ProcessExited
            && tokio::time::timeout(self.config.grace_period, &mut reader)
                .await
                .is_ok();
        if !drained {
            reader.abort();
            let _ = reader.await;
        }
        pipeline.shutdown().await;

        // The watcher may be the task running this teardown.
        match trigger {
            Trigger::Requested => {
                watcher.abort();
                let _ = watcher.await;
            }
            Trigger::ProcessExited => drop(watcher),
        }

        drop(master);

        let status = stop_child(&child, self.config.grace_period).await;
        self.registry.unregister(pid);
        *lock(&self.last_exit) = status;

        tracing::info!(pid, status = ?status, "Session resources released");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let taken = self
            .resources
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(resources) = taken else {
            return;
        };

        let Resources {
            master,
            child,
            pid,
            reader,
            watcher,
            pipeline,
        } = resources;
        tracing::warn!(pid, "Session dropped while running, killing child");

        reader.abort();
        watcher.abort();
        pipeline.cancel();
        drop(master);

        let _ = self.state.advance(SessionState::Terminating);
        child.signal_if_alive(Signal::SIGKILL);
        if child.try_reap().is_none() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Ok(mut sigchld) = pty::child_signals() {
                            let deadline = Instant::now() + DEFAULT_GRACE_PERIOD;
                            child.wait_until(&mut sigchld, Some(deadline)).await;
                        }
                    });
                }
                Err(_) => {
                    child.wait_blocking();
                }
            }
        }
        self.registry.unregister(pid);
        let _ = self.state.advance(SessionState::Terminated);
    }
}

fn prepare_io(master: &Arc<PtyMaster>) -> io::Result<(AsyncFd<ReadHandle>, SignalStream)> {
    master.set_nonblocking()?;
    let sigchld = pty::child_signals()?;
    let read_fd = AsyncFd::new(ReadHandle(Arc::clone(master)))?;
    Ok((read_fd, sigchld))
}

async fn read_loop(master: AsyncFd<ReadHandle>, tx: mpsc::Sender<Vec<u8>>, chunk_size: usize) {
    let fd = master.as_raw_fd();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(fd, error = %e, "PTY readiness failed");
                break;
            }
        };

        let read = match guard.try_io(|inner| inner.get_ref().0.read(&mut buf)) {
            Ok(result) => result,
            Err(_would_block) => continue,
        };

        match read {
            Ok(0) => {
                tracing::debug!(fd, "PTY reached EOF");
                break;
            }
            Ok(n) => {
                tracing::trace!(fd, bytes = n, "Read from PTY");
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once every slave descriptor is closed.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                tracing::debug!(fd, "PTY slave closed");
                break;
            }
            Err(e) => {
                tracing::warn!(fd, error = %e, "PTY read failed");
                break;
            }
        }
    }
}

async fn watch_exit(session: Weak<Inner>, child: Arc<ChildProcess>, mut sigchld: SignalStream) {
    let status = child.wait_until(&mut sigchld, None).await;
    tracing::info!(pid = %child.pid(), status = ?status, "Session process exited");

    if let Some(inner) = session.upgrade() {
        inner.shutdown(Trigger::ProcessExited).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL and wait again.
///
/// Returns `None` only if the child could not be reaped at all.
async fn stop_child(child: &ChildProcess, grace: Duration) -> Option<ExitStatus> {
    if let Some(status) = child.try_reap() {
        return Some(status);
    }

    let mut sigchld = match pty::child_signals() {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to subscribe to SIGCHLD, falling back to timed waits");
            None
        }
    };

    for sig in [Signal::SIGTERM, Signal::SIGKILL] {
        if !child.signal_if_alive(sig) {
            return child.try_reap();
        }
        let deadline = Instant::now() + grace;
        let status = match sigchld.as_mut() {
            Some(stream) => child.wait_until(stream, Some(deadline)).await,
            None => {
                tokio::time::sleep_until(deadline).await;
                child.try_reap()
            }
        };
        if status.is_some() {
            return status;
        }
        if sig == Signal::SIGTERM {
            tracing::warn!(
                pid = %child.pid(),
                grace_ms = grace.as_millis() as u64,
                "Child ignored SIGTERM, sending SIGKILL"
            );
        }
    }

    tracing::error!(pid = %child.pid(), "Child could not be reaped");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::StateKind;

    const WAIT: Duration = Duration::from_secs(5);

    fn session() -> (Session, Arc<ProcessRegistry>) {
        let registry = Arc::new(ProcessRegistry::new());
        let config = SessionConfig {
            grace_period: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        (Session::with_registry(config, Arc::clone(&registry)), registry)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_for(session: &Session, kind: StateKind) {
        let mut rx = session.subscribe();
        if session.state().kind() == kind {
            return;
        }
        tokio::time::timeout(WAIT, async {
            while let Ok(state) = rx.recv().await {
                if state.kind() == kind {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {kind}"));
    }

    async fn wait_for_output(session: &Session, needle: &str) {
        tokio::time::timeout(WAIT, async {
            while !session.output().contains(needle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("output never contained {needle:?}: {:?}", session.output()));
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_buffer_chars, 50_000);
        assert_eq!(config.debounce_interval, Duration::from_millis(300));
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.grace_period, Duration::from_millis(500));
        assert_eq!((config.cols, config.rows), (80, 24));
    }

    #[tokio::test]
    async fn test_write_before_start_is_rejected() {
        let (session, _) = session();
        assert_eq!(session.write(b"hello"), -1);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let (session, registry) = session();
        let err = session
            .start("/nonexistent/binary", &[], &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::ExecutableNotFound { .. }));
        assert_eq!(session.state(), SessionState::Failed { error: err });
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_write_terminate() {
        let (session, registry) = session();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();

        let pid = session.pid().unwrap();
        assert!(registry.contains(pid));
        assert!(matches!(session.state(), SessionState::Running { .. }));

        assert_eq!(session.write(b"hello\n"), 6);
        wait_for_output(&session, "hello").await;

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.pid().is_none());
        assert!(!registry.contains(pid));
        assert!(session.exit_status().is_some());
        assert_eq!(session.write(b"late"), -1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (session, _) = session();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();

        let err = session
            .start("/bin/cat", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidStateTransition {
                from: StateKind::Running,
                to: StateKind::Starting,
            }
        );
        assert!(session.is_running());
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_spontaneous_exit_is_cleaned_up() {
        let (session, registry) = session();
        session
            .start("/bin/sh", &args(&["-c", "echo bye; exit 3"]), &HashMap::new())
            .await
            .unwrap();

        wait_for(&session, StateKind::Terminated).await;
        assert_eq!(session.exit_status(), Some(ExitStatus::Exited(3)));
        assert!(session.output().contains("bye"));
        assert!(registry.is_empty());

        // Terminating after the fact is a no-op.
        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_under_concurrency() {
        let (session, _) = session();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();

        let mut rx = session.subscribe();
        let calls: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.terminate().await })
            })
            .collect();
        for call in calls {
            call.await.unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state.kind());
        }
        assert_eq!(seen, vec![StateKind::Terminating, StateKind::Terminated]);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let (session, _) = session();
        session
            .start(
                "/bin/sh",
                &args(&["-c", "trap '' TERM HUP; echo ready; exec sleep 30"]),
                &HashMap::new(),
            )
            .await
            .unwrap();
        wait_for_output(&session, "ready").await;

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(
            session.exit_status(),
            Some(ExitStatus::Signaled(Signal::SIGKILL))
        );
    }

    #[tokio::test]
    async fn test_reset_allows_restart() {
        let (session, _) = session();
        assert!(session.reset().await.is_err());

        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        session.terminate().await;

        let err = session
            .start("/bin/cat", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidStateTransition { .. }));

        session.reset().await.unwrap();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        assert!(session.is_running());
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_resize() {
        let (session, _) = session();
        assert_eq!(session.resize(100, 30), Err(SessionError::NotRunning));

        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        assert!(session.resize(100, 30).is_ok());
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_pty_is_controlling_terminal() {
        let (session, _) = session();
        session
            .start(
                "/bin/sh",
                &args(&[
                    "-c",
                    "if (exec </dev/tty) 2>/dev/null; then echo HAS_TTY; else echo NO_TTY; fi",
                ]),
                &HashMap::new(),
            )
            .await
            .unwrap();

        wait_for(&session, StateKind::Terminated).await;
        assert!(session.output().contains("HAS_TTY"), "{:?}", session.output());
    }

    #[tokio::test]
    async fn test_interrupt_character_stops_child() {
        let (session, registry) = session();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();

        assert_eq!(session.write(b"\x03"), 1);
        wait_for(&session, StateKind::Terminated).await;
        assert_eq!(
            session.exit_status(),
            Some(ExitStatus::Signaled(Signal::SIGINT))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_environment_reaches_child() {
        let (session, _) = session();
        let mut env = HashMap::new();
        env.insert("PTYVISOR_GREETING".to_string(), "hi-there".to_string());
        session
            .start("/bin/sh", &args(&["-c", "echo $PTYVISOR_GREETING"]), &env)
            .await
            .unwrap();

        wait_for(&session, StateKind::Terminated).await;
        assert!(session.output().contains("hi-there"));
    }

    #[tokio::test]
    async fn test_callbacks_receive_output() {
        let (session, _) = session();
        let chunks = Arc::new(Mutex::new(String::new()));
        let flushes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&chunks);
        session.set_output_handler(move |text| sink.lock().unwrap().push_str(text));
        let sink = Arc::clone(&flushes);
        session.set_flush_handler(move |text| sink.lock().unwrap().push(text.to_string()));

        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        session.write(b"ping\n");
        wait_for_output(&session, "ping").await;

        tokio::time::timeout(WAIT, async {
            while flushes.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(chunks.lock().unwrap().contains("ping"));
        assert!(flushes.lock().unwrap()[0].contains("ping"));
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_state_change_callback() {
        let (session, _) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = session.on_state_change(move |state| sink.lock().unwrap().push(state.kind()));

        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        session.terminate().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StateKind::Starting,
                StateKind::Running,
                StateKind::Terminating,
                StateKind::Terminated,
            ]
        );
        listener.abort();
    }

    #[tokio::test]
    async fn test_drop_kills_running_child() {
        let (session, registry) = session();
        session.start("/bin/cat", &[], &HashMap::new()).await.unwrap();
        let pid = session.pid().unwrap();

        drop(session);
        assert!(!registry.contains(pid));
    }
}
