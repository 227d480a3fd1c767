//! Execution domain types

use crate::domain::job::JobStatus;
use crate::domain::operation::NodeId;
use serde::{Deserialize, Serialize};

/// One run of a pipeline: a container of jobs copied from the pipeline
/// template, owned by a single orchestrator for the duration of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: NodeId,
    pub name: String,
    pub status: ExecutionStatus,
    /// Id of the pipeline this execution was created from.
    pub pipeline_id: Option<NodeId>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub job_ids: Vec<NodeId>,
}

/// Aggregate status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    /// Computes the aggregate status from child job statuses.
    ///
    /// Cancellation takes precedence over individual failures; failure
    /// over partial success. Success requires every job to succeed.
    pub fn aggregate<I>(canceled: bool, statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        if canceled {
            return ExecutionStatus::Canceled;
        }

        let mut all_success = true;
        for status in statuses {
            match status {
                JobStatus::Fail => return ExecutionStatus::Failed,
                JobStatus::Success => {}
                _ => all_success = false,
            }
        }

        if all_success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Running
        }
    }

    pub fn as_attribute(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
        }
    }

    pub fn from_attribute(value: &str) -> Self {
        match value {
            "success" => ExecutionStatus::Success,
            "failed" => ExecutionStatus::Failed,
            "canceled" => ExecutionStatus::Canceled,
            _ => ExecutionStatus::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn test_aggregate_all_success() {
        let status = ExecutionStatus::aggregate(false, [Success, Success, Success]);
        assert_eq!(status, ExecutionStatus::Success);
    }

    #[test]
    fn test_aggregate_any_failure() {
        let status = ExecutionStatus::aggregate(false, [Success, Fail, Success]);
        assert_eq!(status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_canceled_takes_precedence() {
        let status = ExecutionStatus::aggregate(true, [Success, Fail, Canceled]);
        assert_eq!(status, ExecutionStatus::Canceled);
    }

    #[test]
    fn test_incomplete_run_is_still_running() {
        let status = ExecutionStatus::aggregate(false, [Success, Running]);
        assert_eq!(status, ExecutionStatus::Running);
    }
}
