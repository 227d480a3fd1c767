//! Pulse (heartbeat) client
//!
//! The pulse service is a TTL-based liveness channel keyed by run id.
//! An orchestrator updates its run's pulse while it works; on restart,
//! checking the pulse tells it whether another process still owns an
//! in-flight job.

use crate::error::Result;
use crate::http::{empty_response, json_response, trim_base};
use forge_core::dto::pulse::Pulse;
use reqwest::Client;

/// HTTP client for the pulse service
#[derive(Debug, Clone)]
pub struct PulseClient {
    base_url: String,
    client: Client,
}

impl PulseClient {
    /// Create a new pulse client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url),
            client: Client::new(),
        }
    }

    /// Get the base URL of the pulse service
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Refresh the heartbeat for a run id
    pub async fn update(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/api/pulse/{}", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        empty_response(response).await
    }

    /// Check the liveness of a run id
    ///
    /// # Returns
    /// `Alive` while the TTL holds, `Dead` once it lapses, or
    /// `DoesntExist` for a run the service has never seen
    pub async fn check(&self, run_id: &str) -> Result<Pulse> {
        let url = format!("{}/api/pulse/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        json_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = PulseClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
