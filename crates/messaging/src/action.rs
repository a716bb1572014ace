//! User-facing lifecycle actions and the states they are offered from.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Cancel,
    Stop,
    Start,
    Delete,
}

impl JobAction {
    pub const ALL: [JobAction; 4] = [
        JobAction::Cancel,
        JobAction::Stop,
        JobAction::Start,
        JobAction::Delete,
    ];

    /// Whether the action's precondition holds for `status`.
    pub fn permitted_from(self, status: JobStatus) -> bool {
        match self {
            JobAction::Cancel => status == JobStatus::Queued,
            JobAction::Stop => status == JobStatus::Processing,
            JobAction::Start => matches!(status, JobStatus::Failed | JobStatus::Stopped),
            JobAction::Delete => status.is_terminal(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobAction::Cancel => "Cancel",
            JobAction::Stop => "Stop",
            JobAction::Start => "Start",
            JobAction::Delete => "Delete",
        }
    }
}

impl JobStatus {
    /// Actions a client should offer for a job in this status.
    pub fn available_actions(self) -> Vec<JobAction> {
        JobAction::ALL
            .into_iter()
            .filter(|a| a.permitted_from(self))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_per_status() {
        use JobAction::*;
        assert_eq!(JobStatus::Queued.available_actions(), vec![Cancel]);
        assert_eq!(JobStatus::Processing.available_actions(), vec![Stop]);
        assert_eq!(JobStatus::Completed.available_actions(), vec![Delete]);
        assert_eq!(JobStatus::Failed.available_actions(), vec![Start, Delete]);
        assert_eq!(JobStatus::Cancelled.available_actions(), vec![Delete]);
        assert_eq!(JobStatus::Stopped.available_actions(), vec![Start, Delete]);
    }
}
