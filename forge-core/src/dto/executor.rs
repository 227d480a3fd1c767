//! Remote executor wire types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Handle returned when a job bundle is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorJobInfo {
    /// Remote job id (hash of the submitted bundle).
    pub hash: String,
    /// Cancellation token, when the executor issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Poll payload describing the current state of a remote job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub status: ExecutorStatus,
    /// Index of the last stdout line the executor has produced, if any.
    #[serde(default)]
    pub output_number: Option<u64>,
    /// Declared result artifact name to content hash.
    #[serde(default)]
    pub result_hashes: HashMap<String, String>,
}

/// Remote job status.
///
/// Status strings outside the known set are preserved verbatim so they
/// can be surfaced in diagnostics instead of being flattened to a
/// generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorStatus {
    Created,
    Running,
    Success,
    Failed,
    Canceled,
    Unknown(String),
}

impl ExecutorStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutorStatus::Created | ExecutorStatus::Running)
    }
}

impl From<&str> for ExecutorStatus {
    fn from(value: &str) -> Self {
        match value {
            "CREATED" => ExecutorStatus::Created,
            "RUNNING" => ExecutorStatus::Running,
            "SUCCESS" => ExecutorStatus::Success,
            "FAILED" | "FAILED_TO_EXECUTE" => ExecutorStatus::Failed,
            "CANCELED" => ExecutorStatus::Canceled,
            other => ExecutorStatus::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutorStatus::Created => "CREATED",
            ExecutorStatus::Running => "RUNNING",
            ExecutorStatus::Success => "SUCCESS",
            ExecutorStatus::Failed => "FAILED",
            ExecutorStatus::Canceled => "CANCELED",
            ExecutorStatus::Unknown(raw) => raw,
        };
        f.write_str(s)
    }
}

impl Serialize for ExecutorStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExecutorStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ExecutorStatus::from(raw.as_str()))
    }
}

/// One element of an incremental stdout slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub number: u64,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(ExecutorStatus::from("RUNNING"), ExecutorStatus::Running);
        assert_eq!(ExecutorStatus::from("FAILED_TO_EXECUTE"), ExecutorStatus::Failed);
        assert_eq!(
            ExecutorStatus::from("SEGFAULT"),
            ExecutorStatus::Unknown("SEGFAULT".to_string())
        );
    }

    #[test]
    fn test_unknown_status_round_trips() {
        let status = ExecutorStatus::from("SEGFAULT");
        let json = serde_json::to_string(&status).unwrap();
        let back: ExecutorStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }

    #[test]
    fn test_active_states() {
        assert!(ExecutorStatus::Created.is_active());
        assert!(ExecutorStatus::Running.is_active());
        assert!(!ExecutorStatus::Canceled.is_active());
    }
}
