//! Supervisor lifecycle states
//!
//! ```text
//! Idle → [Provisioning] → Starting → Ready
//!                             │         │ nonzero exit
//!                             ▼         ▼
//!                          Crashed ◄─ Restarting ─► Starting ...
//! ```
//!
//! `Error` (unlaunchable runtime) and `Crashed` (timeout, restart cap) are
//! left only through a manual restart. `ShuttingDown` is final.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// Nothing running, nothing scheduled
    #[default]
    Idle,
    /// Bootstrapping the worker runtime
    Provisioning,
    /// Worker spawned, waiting for the handshake
    Starting,
    /// Worker published its endpoint
    Ready,
    /// Waiting out the delay before an automatic restart
    Restarting,
    /// Unrecoverable without a manual restart
    Crashed,
    /// Runtime or executable unusable
    Error,
    /// Tearing down for good
    ShuttingDown,
}

impl SupervisorState {
    /// States automatic recovery must not leave
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorState::Crashed | SupervisorState::Error | SupervisorState::ShuttingDown
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Provisioning => "provisioning",
            SupervisorState::Starting => "starting",
            SupervisorState::Ready => "ready",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Error => "error",
            SupervisorState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SupervisorState::Crashed.is_terminal());
        assert!(SupervisorState::Error.is_terminal());
        assert!(SupervisorState::ShuttingDown.is_terminal());
        assert!(!SupervisorState::Restarting.is_terminal());
        assert!(!SupervisorState::Ready.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(SupervisorState::default().to_string(), "idle");
        assert_eq!(SupervisorState::ShuttingDown.to_string(), "shutting down");
    }
}
