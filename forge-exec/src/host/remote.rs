//! Remote service adapters
//!
//! Implements the host contracts over the `forge-client` HTTP clients,
//! so an orchestrator wired against traits can run against the real
//! services unchanged.

use crate::error::Result;
use crate::host::{ComputeService, LogStore, OriginService, PulseService};
use async_trait::async_trait;
use forge_client::{ExecutorClient, LogsClient, OriginClient, PulseClient};
use forge_core::dto::executor::{ExecutorInfo, ExecutorJobInfo, OutputLine};
use forge_core::dto::origin::JobOrigin;
use forge_core::dto::pulse::Pulse;

#[async_trait]
impl ComputeService for ExecutorClient {
    async fn create_job(&self, bundle_hash: &str) -> Result<ExecutorJobInfo> {
        Ok(ExecutorClient::create_job(self, bundle_hash).await?)
    }

    async fn get_info(&self, hash: &str) -> Result<ExecutorInfo> {
        Ok(ExecutorClient::get_info(self, hash).await?)
    }

    async fn get_output(&self, hash: &str, from: u64, to: u64) -> Result<Vec<OutputLine>> {
        Ok(ExecutorClient::get_output(self, hash, from, to).await?)
    }

    async fn cancel_job(&self, hash: &str, secret: &str) -> Result<()> {
        Ok(ExecutorClient::cancel_job(self, hash, secret).await?)
    }
}

#[async_trait]
impl PulseService for PulseClient {
    async fn update(&self, run_id: &str) -> Result<()> {
        Ok(PulseClient::update(self, run_id).await?)
    }

    async fn check(&self, run_id: &str) -> Result<Pulse> {
        Ok(PulseClient::check(self, run_id).await?)
    }
}

#[async_trait]
impl OriginService for OriginClient {
    async fn record(&self, origin: &JobOrigin) -> Result<()> {
        Ok(OriginClient::record(self, origin).await?)
    }

    async fn get_origin(&self, hash: &str) -> Result<Option<JobOrigin>> {
        match OriginClient::get_origin(self, hash).await {
            Ok(origin) => Ok(Some(origin)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn fork(&self, hash: &str, branch: &str) -> Result<()> {
        Ok(OriginClient::fork(self, hash, branch).await?)
    }
}

#[async_trait]
impl LogStore for LogsClient {
    async fn append(&self, job_id: &str, text: &str) -> Result<()> {
        Ok(LogsClient::append(self, job_id, text).await?)
    }

    async fn get(&self, job_id: &str) -> Result<String> {
        Ok(LogsClient::get(self, job_id).await?)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        Ok(LogsClient::delete(self, job_id).await?)
    }

    async fn line_count(&self, job_id: &str) -> Result<i64> {
        Ok(LogsClient::line_count(self, job_id).await?)
    }

    async fn fork(&self, job_id: &str, branch: &str) -> Result<()> {
        Ok(LogsClient::fork(self, job_id, branch).await?)
    }
}
