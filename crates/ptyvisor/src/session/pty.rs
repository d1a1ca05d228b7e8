//! PTY allocation and child process spawning.
//!
//! This module wraps the Unix primitives the session manager is built on:
//! `openpty` for the master/slave pair, `posix_spawn` with file actions for
//! attaching the child to the slave as its controlling terminal, and
//! non-blocking `waitpid` for reaping.

use std::collections::HashMap;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as os_signal, Signal as SignalStream, SignalKind};
use tokio::time::Instant;

use super::error::SessionError;

/// The master side of a PTY pair.
///
/// Dropping it closes the descriptor. There is exactly one `PtyMaster` per
/// pair, so the descriptor is closed exactly once.
#[derive(Debug)]
pub struct PtyMaster {
    file: File,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Puts the descriptor into non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(())
    }

    /// Reads whatever is available into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Writes `data`, returning the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        (&self.file).write(data)
    }

    /// Sets the terminal window size.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let winsize = window_size(cols, rows);
        // SAFETY: the descriptor is open for the lifetime of `self` and
        // TIOCSWINSZ only reads the winsize struct we pass in.
        let result = unsafe { libc::ioctl(self.file.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for PtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for PtyMaster {
    fn drop(&mut self) {
        tracing::debug!(fd = self.file.as_raw_fd(), "Closing PTY master");
    }
}

/// A freshly allocated PTY pair.
pub struct PtyPair {
    /// Master side, kept by the session.
    pub master: PtyMaster,
    /// Slave side, handed to the child and then closed by the parent.
    pub slave: OwnedFd,
}

fn window_size(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}

/// Allocates a PTY pair with the given window size.
///
/// Both descriptors are marked close-on-exec so that children spawned by
/// other sessions never inherit them.
pub fn open_pty(cols: u16, rows: u16) -> Result<PtyPair, SessionError> {
    let winsize = window_size(cols, rows);
    let pair = openpty(Some(&winsize), None).map_err(|e| SessionError::PtyCreationFailed {
        os_error_code: e as i32,
    })?;

    for fd in [&pair.master, &pair.slave] {
        set_cloexec(fd).map_err(|e| SessionError::PtyCreationFailed {
            os_error_code: e as i32,
        })?;
    }

    tracing::debug!(
        master_fd = pair.master.as_raw_fd(),
        slave_fd = pair.slave.as_raw_fd(),
        "Allocated PTY pair"
    );

    Ok(PtyPair {
        master: PtyMaster::new(pair.master),
        slave: pair.slave,
    })
}

fn cstring(bytes: &[u8]) -> Result<CString, SessionError> {
    CString::new(bytes).map_err(|_| SessionError::SpawnFailed {
        os_error_code: libc::EINVAL,
    })
}

/// Builds the child's environment: ours, overlaid with `overrides`.
fn build_environment(overrides: &HashMap<String, String>) -> Vec<CString> {
    let mut merged: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(key, _)| {
            key.to_str()
                .map(|key| !overrides.contains_key(key))
                .unwrap_or(true)
        })
        .collect();
    merged.extend(
        overrides
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );

    merged
        .into_iter()
        .filter_map(|(key, value)| {
            if key.is_empty() || key.as_bytes().contains(&b'=') {
                tracing::warn!(key = ?key, "Skipping invalid environment variable name");
                return None;
            }
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).ok()
        })
        .collect()
}

/// Returns the device path of the terminal open on `fd`.
fn tty_path(fd: &OwnedFd) -> Result<CString, i32> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is writable for its full length and ttyname_r writes a
    // NUL-terminated string within it on success.
    let rc = unsafe {
        libc::ttyname_r(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if rc != 0 {
        return Err(rc);
    }
    CStr::from_bytes_until_nul(&buf)
        .map(CStr::to_owned)
        .map_err(|_| libc::ENAMETOOLONG)
}

/// Owns a `posix_spawn_file_actions_t` and destroys it on drop.
struct FileActions(libc::posix_spawn_file_actions_t);

impl FileActions {
    fn new() -> Result<Self, i32> {
        // SAFETY: an all-zero value is a valid target for init, which fully
        // initializes it before any other use.
        let mut raw: libc::posix_spawn_file_actions_t = unsafe { std::mem::zeroed() };
        // SAFETY: `raw` is a valid, writable file actions object.
        let rc = unsafe { libc::posix_spawn_file_actions_init(&mut raw) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(Self(raw))
    }

    fn open(&mut self, target: RawFd, path: &CStr, flags: libc::c_int) -> Result<(), i32> {
        // SAFETY: `self.0` was initialized in `new`; the path is copied by
        // the call.
        match unsafe {
            libc::posix_spawn_file_actions_addopen(&mut self.0, target, path.as_ptr(), flags, 0)
        } {
            0 => Ok(()),
            rc => Err(rc),
        }
    }

    fn dup2(&mut self, fd: RawFd, target: RawFd) -> Result<(), i32> {
        // SAFETY: `self.0` was initialized in `new`.
        match unsafe { libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, target) } {
            0 => Ok(()),
            rc => Err(rc),
        }
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        // SAFETY: `self.0` was initialized in `new` and is destroyed once.
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Signals reset to their default action in the child, in case the host
/// ignores them.
const TERMINAL_SIGNALS: [libc::c_int; 6] = [
    libc::SIGPIPE,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTSTP,
    libc::SIGHUP,
    libc::SIGTERM,
];

/// Owns a `posix_spawnattr_t` and destroys it on drop.
struct SpawnAttr(libc::posix_spawnattr_t);

impl SpawnAttr {
    fn new() -> Result<Self, i32> {
        // SAFETY: see `FileActions::new`.
        let mut raw: libc::posix_spawnattr_t = unsafe { std::mem::zeroed() };
        // SAFETY: `raw` is a valid, writable attribute object.
        let rc = unsafe { libc::posix_spawnattr_init(&mut raw) };
        if rc != 0 {
            return Err(rc);
        }
        let mut attr = Self(raw);
        attr.configure()?;
        Ok(attr)
    }

    /// New session, default job-control signals, empty signal mask.
    ///
    /// `setsid` runs before the file actions, so the first open of the slave
    /// makes it the child's controlling terminal.
    fn configure(&mut self) -> Result<(), i32> {
        let flags =
            libc::POSIX_SPAWN_SETSID as libc::c_int | libc::POSIX_SPAWN_SETSIGDEF | libc::POSIX_SPAWN_SETSIGMASK;

        // SAFETY: `self.0` was initialized by posix_spawnattr_init; the
        // sigset_t values are initialized by sigemptyset before use.
        unsafe {
            let mut default_signals: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut default_signals);
            for sig in TERMINAL_SIGNALS {
                libc::sigaddset(&mut default_signals, sig);
            }
            let rc = libc::posix_spawnattr_setsigdefault(&mut self.0, &default_signals);
            if rc != 0 {
                return Err(rc);
            }

            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            let rc = libc::posix_spawnattr_setsigmask(&mut self.0, &mask);
            if rc != 0 {
                return Err(rc);
            }

            let rc = libc::posix_spawnattr_setflags(&mut self.0, flags as libc::c_short);
            if rc != 0 {
                return Err(rc);
            }
        }
        Ok(())
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        // SAFETY: `self.0` was initialized in `new` and is destroyed once.
        unsafe { libc::posix_spawnattr_destroy(&mut self.0) };
    }
}

/// Spawns `program` with its standard streams attached to `slave`.
///
/// `argv[0]` is the program path. The caller remains responsible for
/// closing `slave` afterwards, whatever the outcome.
pub fn spawn_on_pty(
    slave: &OwnedFd,
    program: &Path,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Pid, SessionError> {
    let spawn_failed = |os_error_code: i32| SessionError::SpawnFailed { os_error_code };

    let program_c = cstring(program.as_os_str().as_bytes())?;
    let mut argv_c = Vec::with_capacity(args.len() + 1);
    argv_c.push(program_c.clone());
    for arg in args {
        argv_c.push(cstring(OsStr::new(arg).as_bytes())?);
    }
    let envp_c = build_environment(env);

    let mut argv: Vec<*mut libc::c_char> = argv_c
        .iter()
        .map(|arg| arg.as_ptr() as *mut libc::c_char)
        .collect();
    argv.push(std::ptr::null_mut());
    let mut envp: Vec<*mut libc::c_char> = envp_c
        .iter()
        .map(|entry| entry.as_ptr() as *mut libc::c_char)
        .collect();
    envp.push(std::ptr::null_mut());

    // Opened without O_NOCTTY in the new session, the slave becomes the
    // controlling terminal. The parent's slave descriptor is close-on-exec.
    let slave_path = tty_path(slave).map_err(spawn_failed)?;
    let mut actions = FileActions::new().map_err(spawn_failed)?;
    actions
        .open(libc::STDIN_FILENO, &slave_path, libc::O_RDWR)
        .map_err(spawn_failed)?;
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        actions
            .dup2(libc::STDIN_FILENO, target)
            .map_err(spawn_failed)?;
    }
    let attr = SpawnAttr::new().map_err(spawn_failed)?;

    let mut pid: libc::pid_t = 0;
    // SAFETY: every pointer refers to memory owned by this frame that
    // outlives the call; argv and envp are NULL terminated.
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            program_c.as_ptr(),
            &actions.0,
            &attr.0,
            argv.as_ptr(),
            envp.as_ptr(),
        )
    };
    if rc != 0 {
        tracing::warn!(
            program = %program.display(),
            error = %io::Error::from_raw_os_error(rc),
            "posix_spawn failed"
        );
        return Err(spawn_failed(rc));
    }

    tracing::info!(pid = pid, program = %program.display(), "Spawned PTY process");
    Ok(Pid::from_raw(pid))
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Reaped elsewhere; the status was not observed.
    Unknown,
}

impl ExitStatus {
    /// Returns the exit code if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Returns true for a zero exit code.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

/// A spawned child that has not necessarily been reaped yet.
///
/// Reaping and signalling go through the same lock. While the status slot is
/// empty the pid cannot have been recycled, so a signal sent under the lock
/// always reaches our child.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Mutex<Option<ExitStatus>>,
}

impl ChildProcess {
    /// Wraps a pid returned by [`spawn_on_pty`].
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: Mutex::new(None),
        }
    }

    /// Process ID of the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, Option<ExitStatus>> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reap_locked(&self, slot: &mut Option<ExitStatus>) -> Option<ExitStatus> {
        if slot.is_some() {
            return *slot;
        }
        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(ExitStatus::Signaled(sig)),
            Ok(_) => None,
            Err(Errno::ECHILD) => Some(ExitStatus::Unknown),
            Err(e) => {
                tracing::warn!(pid = %self.pid, error = %e, "waitpid failed");
                None
            }
        };
        if let Some(status) = status {
            tracing::debug!(pid = %self.pid, status = ?status, "Reaped child process");
            *slot = Some(status);
        }
        status
    }

    /// Reaps the child if it has exited, without blocking.
    pub fn try_reap(&self) -> Option<ExitStatus> {
        let mut slot = self.lock();
        self.reap_locked(&mut slot)
    }

    /// Sends `sig` unless the child has already been reaped.
    ///
    /// Returns true if the signal was delivered.
    pub fn signal_if_alive(&self, sig: Signal) -> bool {
        let mut slot = self.lock();
        if self.reap_locked(&mut slot).is_some() {
            return false;
        }
        match signal::kill(self.pid, sig) {
            Ok(()) => {
                tracing::debug!(pid = %self.pid, signal = ?sig, "Signalled child process");
                true
            }
            Err(e) => {
                tracing::warn!(pid = %self.pid, signal = ?sig, error = %e, "Failed to signal child");
                false
            }
        }
    }

    /// Blocks the calling thread until the child is reaped.
    ///
    /// Only for contexts without a runtime, after SIGKILL has been sent.
    pub fn wait_blocking(&self) -> ExitStatus {
        let mut slot = self.lock();
        if let Some(status) = *slot {
            return status;
        }
        let status = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => break ExitStatus::Signaled(sig),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => break ExitStatus::Unknown,
            }
        };
        *slot = Some(status);
        status
    }

    /// Waits until the child exits or `deadline` passes.
    ///
    /// Wakes on SIGCHLD rather than polling. Returns `None` on timeout.
    pub async fn wait_until(
        &self,
        sigchld: &mut SignalStream,
        deadline: Option<Instant>,
    ) -> Option<ExitStatus> {
        loop {
            if let Some(status) = self.try_reap() {
                return Some(status);
            }
            let woke = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, sigchld.recv())
                    .await
                    .unwrap_or(Some(())),
                None => sigchld.recv().await,
            };
            if woke.is_none() || deadline.is_some_and(|d| Instant::now() >= d) {
                return self.try_reap();
            }
        }
    }
}

/// Subscribes to SIGCHLD on the current runtime.
///
/// Must be called before the child can exit unobserved: notifications are
/// only recorded for streams that already exist.
pub fn child_signals() -> io::Result<SignalStream> {
    os_signal(SignalKind::child())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> (PtyPair, ChildProcess) {
        let pair = open_pty(80, 24).unwrap();
        let pid = spawn_on_pty(
            &pair.slave,
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            &HashMap::new(),
        )
        .unwrap();
        (pair, ChildProcess::new(pid))
    }

    #[test]
    fn test_open_pty_sets_cloexec() {
        let pair = open_pty(80, 24).unwrap();
        for fd in [pair.master.as_raw_fd(), pair.slave.as_raw_fd()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_set_nonblocking() {
        let pair = open_pty(80, 24).unwrap();
        pair.master.set_nonblocking().unwrap();
        let flags = fcntl(pair.master.as_raw_fd(), FcntlArg::F_GETFL).unwrap();
        assert!(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK));

        let mut buf = [0u8; 16];
        let err = pair.master.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_resize() {
        let pair = open_pty(80, 24).unwrap();
        assert!(pair.master.resize(120, 40).is_ok());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let pair = open_pty(80, 24).unwrap();
        let result = spawn_on_pty(
            &pair.slave,
            Path::new("/nonexistent/program"),
            &[],
            &HashMap::new(),
        );
        assert!(matches!(result, Err(SessionError::SpawnFailed { .. })));
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        let pair = open_pty(80, 24).unwrap();
        let result = spawn_on_pty(
            &pair.slave,
            Path::new("/bin/sh"),
            &["a\0b".to_string()],
            &HashMap::new(),
        );
        assert_eq!(
            result,
            Err(SessionError::SpawnFailed {
                os_error_code: libc::EINVAL
            })
        );
    }

    #[test]
    fn test_environment_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("PATH".to_string(), "/custom/bin".to_string());
        overrides.insert("PTYVISOR_TEST_VAR".to_string(), "a=b".to_string());
        let env = build_environment(&overrides);

        let paths: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"PATH="))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].as_bytes(), b"PATH=/custom/bin");
        assert!(env
            .iter()
            .any(|e| e.as_bytes() == b"PTYVISOR_TEST_VAR=a=b"));
    }

    #[tokio::test]
    async fn test_wait_until_reports_exit_code() {
        let mut sigchld = child_signals().unwrap();
        let (pair, child) = sh("exit 7");
        drop(pair.slave);

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = child.wait_until(&mut sigchld, Some(deadline)).await;
        assert_eq!(status, Some(ExitStatus::Exited(7)));
        assert_eq!(child.try_reap(), Some(ExitStatus::Exited(7)));
    }

    #[tokio::test]
    async fn test_signal_is_not_sent_after_reap() {
        let mut sigchld = child_signals().unwrap();
        let (pair, child) = sh("sleep 30");
        drop(pair.slave);

        assert!(child.try_reap().is_none());
        assert!(child.signal_if_alive(Signal::SIGKILL));

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = child.wait_until(&mut sigchld, Some(deadline)).await;
        assert_eq!(status, Some(ExitStatus::Signaled(Signal::SIGKILL)));

        // Already reaped: no second signal.
        assert!(!child.signal_if_alive(Signal::SIGTERM));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let mut sigchld = child_signals().unwrap();
        let (pair, child) = sh("sleep 30");
        drop(pair.slave);

        let deadline = Instant::now() + Duration::from_millis(100);
        assert!(child.wait_until(&mut sigchld, Some(deadline)).await.is_none());

        child.signal_if_alive(Signal::SIGKILL);
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(child.wait_until(&mut sigchld, Some(deadline)).await.is_some());
    }

    #[test]
    fn test_exit_status_helpers() {
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        assert_eq!(ExitStatus::Signaled(Signal::SIGTERM).code(), None);
        assert!(!ExitStatus::Unknown.success());
    }
}
