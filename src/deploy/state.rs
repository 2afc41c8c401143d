//! Deployment lifecycle state machine
//!
//! ```text
//! pending -> validating -> pulling_image -> creating -> starting -> running
//!                                                         |
//!                                                      failed -> rolled_back
//! ```
//!
//! Forward-only: every non-terminal state may fail, `failed` may proceed
//! to `rolled_back`, and nothing moves backward.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Validating,
    PullingImage,
    Creating,
    Starting,
    Running,
    Failed,
    RolledBack,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot transition deployment from {from} to {to}")]
pub struct InvalidTransition {
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::PullingImage => "pulling_image",
            DeploymentStatus::Creating => "creating",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => DeploymentStatus::Pending,
            "validating" => DeploymentStatus::Validating,
            "pulling_image" => DeploymentStatus::PullingImage,
            "creating" => DeploymentStatus::Creating,
            "starting" => DeploymentStatus::Starting,
            "running" => DeploymentStatus::Running,
            "failed" => DeploymentStatus::Failed,
            "rolled_back" => DeploymentStatus::RolledBack,
            _ => return None,
        })
    }

    /// Terminal states accept no further transitions (except
    /// `failed -> rolled_back`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Running | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    fn forward_order(&self) -> Option<u8> {
        match self {
            DeploymentStatus::Pending => Some(0),
            DeploymentStatus::Validating => Some(1),
            DeploymentStatus::PullingImage => Some(2),
            DeploymentStatus::Creating => Some(3),
            DeploymentStatus::Starting => Some(4),
            DeploymentStatus::Running => Some(5),
            DeploymentStatus::Failed | DeploymentStatus::RolledBack => None,
        }
    }

    pub fn can_transition(&self, to: DeploymentStatus) -> bool {
        match (self, to) {
            // Any non-terminal state may fail.
            (from, DeploymentStatus::Failed) => !from.is_terminal(),
            // Only failed may roll back.
            (DeploymentStatus::Failed, DeploymentStatus::RolledBack) => true,
            // Otherwise strictly one step forward.
            (from, to) => match (from.forward_order(), to.forward_order()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    pub fn transition(&self, to: DeploymentStatus) -> Result<DeploymentStatus, InvalidTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }

    /// Overall progress checkpoint entering this state.
    pub fn progress_percent(&self) -> i64 {
        match self {
            DeploymentStatus::Pending => 0,
            DeploymentStatus::Validating => 10,
            DeploymentStatus::PullingImage => 30,
            DeploymentStatus::Creating => 60,
            DeploymentStatus::Starting => 85,
            DeploymentStatus::Running => 100,
            DeploymentStatus::Failed | DeploymentStatus::RolledBack => 100,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    #[test]
    fn test_forward_chain() {
        let chain = [Pending, Validating, PullingImage, Creating, Starting, Running];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping_or_backward() {
        assert!(!Pending.can_transition(PullingImage));
        assert!(!Creating.can_transition(Validating));
        assert!(!Running.can_transition(Starting));
        assert!(!Starting.can_transition(Starting));
    }

    #[test]
    fn test_any_non_terminal_may_fail() {
        for state in [Pending, Validating, PullingImage, Creating, Starting] {
            assert!(state.can_transition(Failed), "{state} -> failed");
        }
        assert!(!Running.can_transition(Failed));
        assert!(!RolledBack.can_transition(Failed));
        assert!(!Failed.can_transition(Failed));
    }

    #[test]
    fn test_only_failed_rolls_back() {
        assert!(Failed.can_transition(RolledBack));
        for state in [Pending, Validating, PullingImage, Creating, Starting, Running, RolledBack] {
            assert!(!state.can_transition(RolledBack), "{state} -> rolled_back");
        }
    }

    #[test]
    fn test_transition_error_names_both_states() {
        let err = Running.transition(Pending).unwrap_err();
        assert_eq!(err.from, Running);
        assert_eq!(err.to, Pending);
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_progress_endpoints() {
        assert_eq!(Pending.progress_percent(), 0);
        assert_eq!(Running.progress_percent(), 100);
    }

    #[test]
    fn test_roundtrip_strings() {
        for state in [Pending, Validating, PullingImage, Creating, Starting, Running, Failed, RolledBack] {
            assert_eq!(DeploymentStatus::parse(state.as_str()), Some(state));
        }
    }
}
