//! Task status as observed from the external scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a partition task.
///
/// `Defined -> Submitted -> {Pending -> Running -> (Completed | Failed)} | Unknown`.
/// Statuses are only ever observed from the scheduler, never forced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Descriptor built but not yet submitted.
    Defined,
    /// Accepted by the scheduler, not yet observed in a snapshot.
    Submitted,
    /// Waiting in the scheduler queue.
    Pending,
    /// Currently executing.
    Running,
    /// Finished with exit code 0.
    Completed,
    /// Finished unsuccessfully (failed, cancelled, timed out, ...).
    Failed,
    /// The status could not be determined.
    Unknown,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Defined
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defined => write!(f, "defined"),
            Self::Submitted => write!(f, "submitted"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl TaskStatus {
    /// Maps a Slurm job state (as printed by `squeue`/`sacct`) to a status.
    ///
    /// `sacct` may append qualifiers such as `CANCELLED by 1234`; only the
    /// first word is considered.
    #[must_use]
    pub fn from_scheduler_state(state: &str) -> Self {
        let word = state
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();

        match word.as_str() {
            "PENDING" | "PD" | "CONFIGURING" | "CF" | "REQUEUED" | "REQUEUE_HOLD"
            | "REQUEUE_FED" | "RESV_DEL_HOLD" | "SUSPENDED" | "S" => Self::Pending,
            "RUNNING" | "R" | "COMPLETING" | "CG" | "STAGE_OUT" | "SO" | "SIGNALING" => {
                Self::Running
            }
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" | "CANCELLED" | "CA" | "TIMEOUT" | "TO" | "OUT_OF_MEMORY" | "OOM"
            | "NODE_FAIL" | "NF" | "BOOT_FAIL" | "BF" | "DEADLINE" | "DL" | "PREEMPTED" | "PR" => {
                Self::Failed
            }
            _ => Self::Unknown,
        }
    }

    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a sibling in this status keeps its stage from being
    /// considered complete.
    #[must_use]
    pub fn blocks_completion(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Pending | Self::Running | Self::Unknown
        )
    }

    /// Returns true if moving from `self` to `next` is a legal observation.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Defined => matches!(next, Self::Submitted),
            Self::Submitted | Self::Unknown => !matches!(next, Self::Defined | Self::Submitted),
            Self::Pending => matches!(
                next,
                Self::Pending | Self::Running | Self::Completed | Self::Failed | Self::Unknown
            ),
            Self::Running => matches!(
                next,
                Self::Running | Self::Completed | Self::Failed | Self::Unknown
            ),
            Self::Completed | Self::Failed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
        assert_eq!(TaskStatus::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_from_scheduler_state() {
        assert_eq!(TaskStatus::from_scheduler_state("PENDING"), TaskStatus::Pending);
        assert_eq!(TaskStatus::from_scheduler_state("R"), TaskStatus::Running);
        assert_eq!(TaskStatus::from_scheduler_state("COMPLETED"), TaskStatus::Completed);
        assert_eq!(
            TaskStatus::from_scheduler_state("CANCELLED by 31337"),
            TaskStatus::Failed
        );
        assert_eq!(TaskStatus::from_scheduler_state("CANCELLED+"), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_scheduler_state("timeout"), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_scheduler_state(""), TaskStatus::Unknown);
        assert_eq!(TaskStatus::from_scheduler_state("SPECIAL_EXIT"), TaskStatus::Unknown);
    }

    #[test]
    fn test_blocks_completion() {
        assert!(TaskStatus::Pending.blocks_completion());
        assert!(TaskStatus::Running.blocks_completion());
        assert!(TaskStatus::Unknown.blocks_completion());
        assert!(!TaskStatus::Completed.blocks_completion());
        assert!(!TaskStatus::Failed.blocks_completion());
    }

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Defined.can_transition_to(TaskStatus::Submitted));
        assert!(!TaskStatus::Defined.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Submitted.can_transition_to(TaskStatus::Unknown));
        assert!(TaskStatus::Unknown.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Completed.is_terminal());
    }

    #[test]
    fn test_task_status_serialize() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::Running);
    }
}
