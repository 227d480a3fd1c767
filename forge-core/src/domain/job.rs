//! Job domain types

use crate::domain::operation::NodeId;
use crate::dto::executor::ExecutorJobInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One remote (or local) run of a single operation.
///
/// Wraps exactly one operation node. Status transitions are driven by the
/// watcher; terminal states are `Success`, `Fail` and `Canceled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Id of the job node in the host graph.
    pub id: NodeId,
    pub name: String,
    /// Id of the wrapped operation node.
    pub operation_id: NodeId,
    pub status: JobStatus,
    /// Remote handle, present once the job has been submitted.
    pub job_info: Option<ExecutorJobInfo>,
    /// Number of stdout lines already drained from the executor.
    pub stdout_line_count: u64,
    /// Hash of the submitted execution bundle.
    pub exec_files: Option<String>,
}

impl Job {
    pub fn new(id: NodeId, name: String, operation_id: NodeId) -> Self {
        Self {
            id,
            name,
            operation_id,
            status: JobStatus::Pending,
            job_info: None,
            stdout_line_count: 0,
            exec_files: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Success | JobStatus::Fail | JobStatus::Canceled
        )
    }
}

/// Job execution status as stored on the job node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Success,
    Fail,
    Canceled,
}

impl JobStatus {
    /// Parses the attribute value stored on a job node. Unknown strings
    /// map to `Pending` so stale models remain loadable.
    pub fn from_attribute(value: &str) -> Self {
        match value {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "fail" => JobStatus::Fail,
            "canceled" => JobStatus::Canceled,
            _ => JobStatus::Pending,
        }
    }

    pub fn as_attribute(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Fail => "fail",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// Per-output result recorded when a job succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Type tag of the produced value, when the executor reported one.
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    /// Content-addressed hash of the serialized value.
    pub data: Option<String>,
}

/// Terminal outcome of watching a job, handed back to the orchestrator.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Output name to result info for every declared output.
    Success { results: HashMap<String, ResultInfo> },
    Failed { reason: String },
    Canceled,
}
