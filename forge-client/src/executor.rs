//! Remote executor client
//!
//! Submits job bundles and tracks them through the executor's REST API.

use crate::error::Result;
use crate::http::{empty_response, json_response, trim_base};
use forge_core::dto::executor::{ExecutorInfo, ExecutorJobInfo, OutputLine};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

/// HTTP client for the remote job executor
#[derive(Debug, Clone)]
pub struct ExecutorClient {
    /// Base URL of the executor (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl ExecutorClient {
    /// Create a new executor client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the executor API
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            client: Client::new(),
        }
    }

    /// Create a new executor client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: trim_base(base_url),
            client,
        }
    }

    /// Get the base URL of the executor
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit a job bundle for execution
    ///
    /// # Arguments
    /// * `bundle_hash` - Content hash of the execution bundle
    ///
    /// # Returns
    /// The remote job handle, including the cancellation secret when the
    /// executor issued one
    pub async fn create_job(&self, bundle_hash: &str) -> Result<ExecutorJobInfo> {
        let url = format!("{}/api/jobs", self.base_url);
        debug!("Submitting job bundle {}", bundle_hash);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "hash": bundle_hash }))
            .send()
            .await?;

        json_response(response).await
    }

    /// Get the current status of a job
    ///
    /// # Arguments
    /// * `hash` - The remote job hash
    pub async fn get_info(&self, hash: &str) -> Result<ExecutorInfo> {
        let url = format!("{}/api/jobs/{}/info", self.base_url, hash);
        let response = self.client.get(&url).send().await?;

        json_response(response).await
    }

    /// Fetch a slice of the job's stdout
    ///
    /// # Arguments
    /// * `hash` - The remote job hash
    /// * `from` - First line to fetch (inclusive)
    /// * `to` - Last line to fetch (exclusive)
    pub async fn get_output(&self, hash: &str, from: u64, to: u64) -> Result<Vec<OutputLine>> {
        let url = format!(
            "{}/api/jobs/{}/output?start={}&end={}",
            self.base_url, hash, from, to
        );
        let response = self.client.get(&url).send().await?;

        json_response(response).await
    }

    /// Cancel a running job
    ///
    /// # Arguments
    /// * `hash` - The remote job hash
    /// * `secret` - The cancellation token issued at submission
    pub async fn cancel_job(&self, hash: &str, secret: &str) -> Result<()> {
        let url = format!("{}/api/jobs/{}/cancel", self.base_url, hash);
        debug!("Canceling job {}", hash);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "secret": secret }))
            .send()
            .await?;

        empty_response(response).await
    }
}
