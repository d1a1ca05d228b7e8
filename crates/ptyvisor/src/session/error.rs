//! Error types for session operations.

use std::path::PathBuf;

use thiserror::Error;

use super::state::StateKind;

/// Errors that can occur during session operations.
///
/// Every variant is cheap to clone so the same error can be returned to the
/// caller of [`start`](super::Session::start) and stored in
/// [`SessionState::Failed`](super::SessionState::Failed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Allocating the PTY master/slave pair failed.
    #[error("failed to allocate PTY pair (errno {os_error_code})")]
    PtyCreationFailed {
        /// The `errno` reported by `openpty`.
        os_error_code: i32,
    },

    /// Spawning the child process failed.
    #[error("failed to spawn process (errno {os_error_code})")]
    SpawnFailed {
        /// The error code reported by `posix_spawn`.
        os_error_code: i32,
    },

    /// The requested transition is not an edge of the lifecycle graph.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// State the session was in.
        from: StateKind,
        /// State that was requested.
        to: StateKind,
    },

    /// The operation needs a running session.
    #[error("session is not running")]
    NotRunning,

    /// Input was rejected because the session is not running.
    #[error("write rejected: session is not running")]
    WriteRejectedNotRunning,

    /// Changing the terminal window size failed.
    #[error("failed to resize PTY (errno {os_error_code})")]
    ResizeFailed {
        /// The `errno` reported by `ioctl`.
        os_error_code: i32,
    },

    /// The executable does not exist.
    #[error("executable not found: {}", path.display())]
    ExecutableNotFound {
        /// The path that was looked up.
        path: PathBuf,
    },
}

impl SessionError {
    /// Returns the message a front end should show for this error.
    ///
    /// Write rejections are transient: the caller can wait for the next
    /// `Running` notification and retry.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::WriteRejectedNotRunning | SessionError::NotRunning => {
                "session not ready".to_string()
            }
            other => format!("could not start session: {other}"),
        }
    }
}
