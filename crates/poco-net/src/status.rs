//! Connection status and its transition rules.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by every connection type.
///
/// Transitions are monotone within one session: `Connected` never falls
/// back to `Connecting`, and the three terminal states absorb everything.
/// A terminated connection is not reusable; create a new instance to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Disconnected)
    }

    /// Whether moving from `self` to `next` is an effective, legal change.
    ///
    /// Re-entering the current state is not a change; nothing leaves a
    /// terminal state; nothing returns to `New`; an established
    /// connection never re-enters `Connecting`.
    pub fn can_advance_to(self, next: Self) -> bool {
        if next == self || self.is_terminal() || next == Self::New {
            return false;
        }
        !(self == Self::Connected && next == Self::Connecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guarded status slot owned by a connection.
///
/// `advance` applies the transition rules and reports whether the status
/// actually changed, so callers emit at most one `"status"` event per
/// effective change.
#[derive(Debug)]
pub struct StatusCell(Mutex<ConnectionStatus>);

impl StatusCell {
    pub fn new() -> Self {
        Self(Mutex::new(ConnectionStatus::New))
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to move to `next`; true when the change took effect.
    pub fn advance(&self, next: ConnectionStatus) -> bool {
        let mut current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !current.can_advance_to(next) {
            return false;
        }
        *current = next;
        true
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of claiming the right to run a connect attempt.
pub(crate) enum ConnectClaim {
    /// The caller advanced the status to `Connecting`; run the attempt.
    Proceed,
    /// Another caller is mid-attempt; wait for its outcome.
    Join,
    AlreadyConnected,
    Terminal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn reentering_the_current_state_is_a_no_op() {
        for status in [New, Connecting, Connected, Closed, Failed, Disconnected] {
            assert!(!status.can_advance_to(status));
        }
    }

    #[test]
    fn terminal_states_absorb() {
        for terminal in [Closed, Failed, Disconnected] {
            assert!(terminal.is_terminal());
            for next in [New, Connecting, Connected, Closed, Failed, Disconnected] {
                assert!(!terminal.can_advance_to(next));
            }
        }
    }

    #[test]
    fn connected_never_returns_to_connecting() {
        assert!(!Connected.can_advance_to(Connecting));
        assert!(Connecting.can_advance_to(Connected));
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(New.can_advance_to(Connecting));
        assert!(New.can_advance_to(Failed));
        assert!(Connecting.can_advance_to(Failed));
        assert!(Connected.can_advance_to(Closed));
        assert!(Connected.can_advance_to(Disconnected));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Connected).unwrap(), "\"connected\"");
        assert_eq!(Failed.to_string(), "failed");
        let back: ConnectionStatus = serde_json::from_str("\"connecting\"").unwrap();
        assert_eq!(back, Connecting);
    }

    #[test]
    fn cell_reports_effective_changes_only() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), New);
        assert!(cell.advance(Connecting));
        assert!(!cell.advance(Connecting));
        assert!(cell.advance(Connected));
        assert!(cell.advance(Failed));
        assert!(!cell.advance(Closed));
        assert_eq!(cell.get(), Failed);
    }
}
