//! Job log client
//!
//! Persists drained stdout outside the versioned model so long logs do
//! not bloat commits. Line counts survive orchestrator restarts and seed
//! the resume path.

use crate::error::Result;
use crate::http::{empty_response, json_response, trim_base};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Log metadata returned by the service.
#[derive(Debug, Clone, Deserialize)]
struct LogMetadata {
    /// Number of lines stored, or -1 when unknown.
    #[serde(rename = "lineCount")]
    line_count: i64,
}

/// HTTP client for the job-log store
#[derive(Debug, Clone)]
pub struct LogsClient {
    base_url: String,
    client: Client,
}

impl LogsClient {
    /// Create a new logs client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            client: Client::new(),
        }
    }

    /// Get the base URL of the log store
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Append a block of text to a job's log
    pub async fn append(&self, job_id: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }

        let url = format!("{}/api/logs/{}", self.base_url, job_id);
        debug!("Appending {} bytes to log for {}", text.len(), job_id);
        let response = self
            .client
            .patch(&url)
            .json(&json!({ "patch": text }))
            .send()
            .await?;

        empty_response(response).await
    }

    /// Fetch the full stored log for a job
    pub async fn get(&self, job_id: &str) -> Result<String> {
        let url = format!("{}/api/logs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        json_response(response).await
    }

    /// Delete the stored log for a job
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/api/logs/{}", self.base_url, job_id);
        let response = self.client.delete(&url).send().await?;

        empty_response(response).await
    }

    /// Number of stored lines for a job, or -1 when unknown
    pub async fn line_count(&self, job_id: &str) -> Result<i64> {
        let url = format!("{}/api/logs/{}/metadata", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        let metadata: LogMetadata = json_response(response).await?;
        Ok(metadata.line_count)
    }

    /// Migrate a job's log to a forked branch
    pub async fn fork(&self, job_id: &str, branch: &str) -> Result<()> {
        let url = format!("{}/api/logs/{}/fork", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "branch": branch }))
            .send()
            .await?;

        empty_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = LogsClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
