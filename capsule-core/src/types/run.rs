//! Recorded-run domain types.

use crate::error::{CapsuleError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Exit status reported for cancelled builds and runs.
///
/// Negative so it can never collide with a process exit code or an
/// engine-reported failure code.
pub const CANCELLED_EXIT_STATUS: i64 = -123;

/// Recorded run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// COMPLETED, FAILED and CANCELLED never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }

    /// Numeric code used by the catalog service.
    pub fn code(self) -> i32 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            Self::Completed => 3,
            Self::Failed => 4,
            Self::Cancelled => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Starting),
            1 => Some(Self::Running),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tracks the current state of one run and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct RunStatus {
    state: RunState,
}

impl RunStatus {
    pub fn new() -> Self {
        Self { state: RunState::Starting }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CapsuleError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A working mount prepared for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMount {
    /// Content-addressed mount identifier
    pub id: String,
    /// Host directory bound into the run container
    pub host_path: PathBuf,
    /// Filesystem helper serving the mount, if any
    pub helper_id: Option<String>,
}

/// Resources allocated on behalf of one run.
///
/// Owned by exactly one executor invocation and handed to the cleaner on teardown;
/// the cleaner `take()`s each handle so a second teardown finds nothing to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResources {
    pub container_id: Option<String>,
    pub mount: Option<RunMount>,
}

impl RunResources {
    pub fn is_empty(&self) -> bool {
        self.container_id.is_none() && self.mount.is_none()
    }
}

/// Catalog projection of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub state: RunState,
    #[serde(default)]
    pub resources: RunResources,
    /// Upstream job driving this run, if known
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Final result of a recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: RunState,
    /// Container exit status, or [`CANCELLED_EXIT_STATUS`]
    pub exit_status: i64,
    /// Image reference the run executed
    pub image: Option<String>,
    /// Workspace mount holding the run artifacts
    pub artifacts_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        let mut status = RunStatus::new();
        status.advance(RunState::Running).unwrap();
        status.advance(RunState::Completed).unwrap();
        assert_eq!(status.state(), RunState::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::Failed, RunState::Cancelled] {
            for next in [
                RunState::Starting,
                RunState::Running,
                RunState::Completed,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        assert!(RunState::Starting.can_transition_to(RunState::Cancelled));
        assert!(RunState::Running.can_transition_to(RunState::Cancelled));
    }

    #[test]
    fn test_no_skipping_running() {
        let mut status = RunStatus::new();
        let err = status.advance(RunState::Completed).unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidTransition { .. }));
        assert_eq!(status.state(), RunState::Starting);
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            RunState::Starting,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::from_code(state.code()), Some(state));
        }
        assert_eq!(RunState::from_code(2), None);
    }

    #[test]
    fn test_cancelled_status_is_distinct() {
        assert!(CANCELLED_EXIT_STATUS < 0);
    }
}
