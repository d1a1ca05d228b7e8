//! Session management module.
//!
//! This module provides the PTY session lifecycle: allocation and spawning,
//! the state machine, output buffering and teardown.

pub mod error;
pub mod manager;
pub mod output;
pub mod pty;
pub mod state;

pub use error::SessionError;
pub use manager::{Session, SessionConfig};
pub use output::{OutputBuffer, OutputCallback};
pub use pty::ExitStatus;
pub use state::{SessionState, StateKind};
