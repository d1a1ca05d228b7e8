//! # ptyvisor
//!
//! PTY session lifecycle management with deterministic teardown.
//!
//! ## Overview
//!
//! ptyvisor spawns a child process attached to a pseudo-terminal, exposes a
//! bidirectional byte stream to it, and tracks it through an explicit
//! lifecycle. Every exit path (explicit termination, the child exiting on
//! its own, or a failed start) releases the PTY descriptors and reaps the
//! child exactly once, even when several of them race.
//!
//! ```text
//!   write() ──────────────────────────► PTY master ──► child
//!                                            │
//!   on_chunk / on_flush ◄── OutputPipeline ◄─┘ read loop
//!
//!   SIGCHLD ──► exit watcher ──┐
//!   terminate() ───────────────┴──► shared teardown ──► Terminated
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use ptyvisor::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::new(SessionConfig::default());
//!     session.set_output_handler(|text| print!("{text}"));
//!
//!     session.start("/bin/sh", &[], &HashMap::new()).await?;
//!     session.write(b"echo hello\n");
//!
//!     session.terminate().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, their state machine and output buffering
//! - [`process`]: Process registry, one-shot commands, environment discovery

pub mod config;
pub mod process;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    ExitStatus, OutputBuffer, OutputCallback, Session, SessionConfig, SessionError, SessionState,
    StateKind,
};

// Re-export process types for convenience
pub use process::{
    login_environment, parse_environment, resolve_executable, run_command, CommandRunner,
    ProcessRegistry,
};
