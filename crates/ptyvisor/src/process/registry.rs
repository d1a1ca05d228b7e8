//! Process-wide registry of live child processes.
//!
//! Sessions and one-shot commands record their children here so that an
//! application that is going down can kill whatever is still alive. The
//! registry is never consulted for per-session decisions.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

static GLOBAL: LazyLock<Arc<ProcessRegistry>> =
    LazyLock::new(|| Arc::new(ProcessRegistry::new()));

/// Set of child pids guarded by its own lock.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: RwLock<HashSet<u32>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry shared by the whole process.
    pub fn global() -> Arc<ProcessRegistry> {
        Arc::clone(&GLOBAL)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<u32>> {
        self.pids.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<u32>> {
        self.pids.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a live child. Returns false if it was already present.
    pub fn register(&self, pid: u32) -> bool {
        let inserted = self.write().insert(pid);
        tracing::trace!(pid, inserted, "Registered child process");
        inserted
    }

    /// Forgets a child. Returns false if it was not present.
    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.write().remove(&pid);
        tracing::trace!(pid, removed, "Unregistered child process");
        removed
    }

    /// Returns true if `pid` is registered.
    pub fn contains(&self, pid: u32) -> bool {
        self.read().contains(&pid)
    }

    /// Returns the registered pids in ascending order.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.read().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Number of registered children.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sends `sig` to every registered child and clears the registry.
    ///
    /// Meant for emergency cleanup at application exit. Returns how many
    /// processes were signalled successfully.
    pub fn kill_all(&self, sig: Signal) -> usize {
        let pids: Vec<u32> = self.write().drain().collect();
        let mut signalled = 0;
        for pid in pids {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match signal::kill(Pid::from_raw(raw), sig) {
                Ok(()) => signalled += 1,
                Err(e) => tracing::debug!(pid, error = %e, "Emergency kill skipped"),
            }
        }
        if signalled > 0 {
            tracing::warn!(count = signalled, signal = ?sig, "Killed leftover child processes");
        }
        signalled
    }
}
