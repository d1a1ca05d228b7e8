//! Auxiliary process handling.
//!
//! This module provides the process registry used for emergency cleanup,
//! the one-shot command runner, and environment discovery helpers.

pub mod discovery;
pub mod registry;
pub mod runner;

pub use discovery::{login_environment, parse_environment, resolve_executable};
pub use registry::ProcessRegistry;
pub use runner::{run_command, CommandRunner};
