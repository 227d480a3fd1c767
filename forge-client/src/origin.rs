//! Job origin client
//!
//! Records which node/job/execution/branch a remote job was started
//! from. Consulted on restart to decide whether a job recorded as
//! `running` belongs to the current branch at all.

use crate::error::Result;
use crate::http::{empty_response, json_response, trim_base};
use forge_core::dto::origin::JobOrigin;
use reqwest::Client;
use serde_json::json;

/// HTTP client for the job-origin registry
#[derive(Debug, Clone)]
pub struct OriginClient {
    base_url: String,
    client: Client,
}

impl OriginClient {
    /// Create a new origin client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            client: Client::new(),
        }
    }

    /// Get the base URL of the origin registry
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Record the origin of a newly submitted job
    pub async fn record(&self, origin: &JobOrigin) -> Result<()> {
        let url = format!("{}/api/origins", self.base_url);
        let response = self.client.post(&url).json(origin).send().await?;

        empty_response(response).await
    }

    /// Fetch the recorded origin for a job hash
    pub async fn get_origin(&self, hash: &str) -> Result<JobOrigin> {
        let url = format!("{}/api/origins/{}", self.base_url, hash);
        let response = self.client.get(&url).send().await?;

        json_response(response).await
    }

    /// Re-point a job's origin after its branch forked
    pub async fn fork(&self, hash: &str, branch: &str) -> Result<()> {
        let url = format!("{}/api/origins/{}/fork", self.base_url, hash);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "branch": branch }))
            .send()
            .await?;

        empty_response(response).await
    }
}
