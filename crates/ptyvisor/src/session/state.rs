//! Session lifecycle state machine.
//!
//! The lifecycle is a small directed graph:
//!
//! ```text
//! Uninitialized -> Starting -> Running -> Terminating -> Terminated
//!       ^              |          |                          |
//!       |              v          v                          |
//!       +---------- Failed <------+                          |
//!       +----------------------------------------------------+
//! ```
//!
//! [`transition`] validates a single edge and performs no I/O.
//! [`StateMachine`] stores the current state behind a mutex and publishes
//! every accepted transition on a broadcast channel.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::error::SessionError;

/// Channel capacity for state change notifications.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed or reset, nothing allocated.
    Uninitialized,
    /// `start()` is in progress.
    Starting,
    /// Child process is alive and attached to the PTY.
    Running {
        /// Process ID of the child.
        pid: u32,
        /// PTY master descriptor.
        master_fd: RawFd,
    },
    /// Teardown is in progress.
    Terminating,
    /// Teardown finished.
    Terminated,
    /// The session failed to start or lost its resources.
    Failed {
        /// What went wrong.
        error: SessionError,
    },
}

/// Payload-free discriminant of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Uninitialized,
    Starting,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl StateKind {
    /// All state kinds, in lifecycle order.
    pub const ALL: [StateKind; 6] = [
        StateKind::Uninitialized,
        StateKind::Starting,
        StateKind::Running,
        StateKind::Terminating,
        StateKind::Terminated,
        StateKind::Failed,
    ];

    fn as_str(self) -> &'static str {
        match self {
            StateKind::Uninitialized => "uninitialized",
            StateKind::Starting => "starting",
            StateKind::Running => "running",
            StateKind::Terminating => "terminating",
            StateKind::Terminated => "terminated",
            StateKind::Failed => "failed",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionState {
    /// Returns the discriminant of this state.
    pub fn kind(&self) -> StateKind {
        match self {
            SessionState::Uninitialized => StateKind::Uninitialized,
            SessionState::Starting => StateKind::Starting,
            SessionState::Running { .. } => StateKind::Running,
            SessionState::Terminating => StateKind::Terminating,
            SessionState::Terminated => StateKind::Terminated,
            SessionState::Failed { .. } => StateKind::Failed,
        }
    }

    /// Returns true if the session is running.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    /// Returns true for `Terminated` and `Failed`.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionState::Terminated | SessionState::Failed { .. }
        )
    }

    /// Returns the child pid when running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            SessionState::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Returns the master descriptor when running.
    pub fn master_fd(&self) -> Option<RawFd> {
        match self {
            SessionState::Running { master_fd, .. } => Some(*master_fd),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running { pid, master_fd } => {
                write!(f, "running (pid {pid}, fd {master_fd})")
            }
            SessionState::Failed { error } => write!(f, "failed: {error}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Returns true if `from -> to` is an edge of the lifecycle graph.
pub fn is_legal(from: StateKind, to: StateKind) -> bool {
    use StateKind::*;
    matches!(
        (from, to),
        (Uninitialized, Starting)
            | (Starting, Running)
            | (Starting, Failed)
            | (Running, Terminating)
            | (Running, Failed)
            | (Terminating, Terminated)
            | (Failed, Uninitialized)
            | (Terminated, Uninitialized)
    )
}

/// Validates a transition and returns the new state.
pub fn transition(
    current: &SessionState,
    proposed: SessionState,
) -> Result<SessionState, SessionError> {
    let (from, to) = (current.kind(), proposed.kind());
    if is_legal(from, to) {
        Ok(proposed)
    } else {
        Err(SessionError::InvalidStateTransition { from, to })
    }
}

/// Mutex-guarded session state with change notifications.
pub struct StateMachine {
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionState>,
}

impl StateMachine {
    /// Creates a state machine in `Uninitialized`.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // The guarded value is always a complete state, so a poisoned lock
        // still holds something valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the current state.
    pub fn current(&self) -> SessionState {
        self.lock().clone()
    }

    /// Runs `f` with the current state while holding the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.lock())
    }

    /// Applies `proposed` if it is a legal successor of the current state.
    ///
    /// On rejection the stored state is left untouched.
    pub fn advance(&self, proposed: SessionState) -> Result<SessionState, SessionError> {
        let mut state = self.lock();
        let next = transition(&state, proposed)?;
        *state = next.clone();

        tracing::debug!(state = %next, "Session state changed");

        // broadcast::Sender::send never waits on receivers, so publishing
        // under the lock keeps notification order equal to transition order.
        let _ = self.events.send(next.clone());
        Ok(next)
    }

    /// Subscribes to state change notifications.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` instead of holding up transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: StateKind) -> SessionState {
        match kind {
            StateKind::Uninitialized => SessionState::Uninitialized,
            StateKind::Starting => SessionState::Starting,
            StateKind::Running => SessionState::Running {
                pid: 4242,
                master_fd: 7,
            },
            StateKind::Terminating => SessionState::Terminating,
            StateKind::Terminated => SessionState::Terminated,
            StateKind::Failed => SessionState::Failed {
                error: SessionError::PtyCreationFailed { os_error_code: 24 },
            },
        }
    }

    const LEGAL: [(StateKind, StateKind); 8] = [
        (StateKind::Uninitialized, StateKind::Starting),
        (StateKind::Starting, StateKind::Running),
        (StateKind::Starting, StateKind::Failed),
        (StateKind::Running, StateKind::Terminating),
        (StateKind::Running, StateKind::Failed),
        (StateKind::Terminating, StateKind::Terminated),
        (StateKind::Failed, StateKind::Uninitialized),
        (StateKind::Terminated, StateKind::Uninitialized),
    ];

    #[test]
    fn test_transition_table_is_exhaustive() {
        for from in StateKind::ALL {
            for to in StateKind::ALL {
                let result = transition(&sample(from), sample(to));
                if LEGAL.contains(&(from, to)) {
                    assert_eq!(result, Ok(sample(to)), "{from} -> {to} should be legal");
                } else {
                    assert_eq!(
                        result,
                        Err(SessionError::InvalidStateTransition { from, to }),
                        "{from} -> {to} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn test_rejected_transition_leaves_state_unchanged() {
        let machine = StateMachine::new();
        machine.advance(SessionState::Starting).unwrap();

        for proposed in [
            SessionState::Uninitialized,
            SessionState::Starting,
            SessionState::Terminating,
            SessionState::Terminated,
        ] {
            assert!(machine.advance(proposed).is_err());
            assert_eq!(machine.current(), SessionState::Starting);
        }
    }

    #[test]
    fn test_full_lifecycle_and_reset() {
        let machine = StateMachine::new();
        machine.advance(SessionState::Starting).unwrap();
        machine.advance(sample(StateKind::Running)).unwrap();
        assert_eq!(machine.current().pid(), Some(4242));
        assert_eq!(machine.current().master_fd(), Some(7));

        machine.advance(SessionState::Terminating).unwrap();
        assert_eq!(machine.current().pid(), None);
        machine.advance(SessionState::Terminated).unwrap();
        assert!(machine.current().is_final());

        // Terminal: only a reset is allowed.
        assert!(machine.advance(SessionState::Starting).is_err());
        machine.advance(SessionState::Uninitialized).unwrap();
        machine.advance(SessionState::Starting).unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_see_every_transition_in_order() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();

        machine.advance(SessionState::Starting).unwrap();
        machine.advance(sample(StateKind::Failed)).unwrap();
        let _ = machine.advance(SessionState::Running { pid: 1, master_fd: 3 });
        machine.advance(SessionState::Uninitialized).unwrap();

        assert_eq!(rx.recv().await.unwrap(), SessionState::Starting);
        assert_eq!(rx.recv().await.unwrap().kind(), StateKind::Failed);
        assert_eq!(rx.recv().await.unwrap(), SessionState::Uninitialized);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_slow_subscriber_does_not_block_transitions() {
        let machine = StateMachine::new();
        let _never_read = machine.subscribe();

        for _ in 0..(STATE_CHANNEL_CAPACITY * 2) {
            machine.advance(SessionState::Starting).unwrap();
            machine.advance(sample(StateKind::Failed)).unwrap();
            machine.advance(SessionState::Uninitialized).unwrap();
        }
        assert_eq!(machine.current(), SessionState::Uninitialized);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(sample(StateKind::Running).to_string(), "running (pid 4242, fd 7)");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }
}
