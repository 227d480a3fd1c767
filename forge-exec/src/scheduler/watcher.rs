//! Remote job watcher
//!
//! Polls the executor for one submitted job: drains new stdout lines,
//! extracts embedded metadata commands, persists model updates through
//! the save buffer and reports the terminal outcome. A cooperative
//! cancellation check runs before every poll so a canceled execution
//! stops its jobs without waiting for the next natural status change.
//!
//! Polling keeps a roughly constant cadence: the next poll is scheduled
//! `interval - elapsed` after the last one started, or immediately when
//! processing already overran the interval.

use crate::error::{ExecError, Result};
use crate::host::{BlobStore, ComputeService, LogStore};
use crate::meta::{attrs, types};
use crate::store::SaveBuffer;
use forge_core::domain::job::{JobOutcome, ResultInfo};
use forge_core::domain::{NodeId, Port};
use forge_core::dto::executor::{ExecutorInfo, ExecutorJobInfo, ExecutorStatus};
use forge_core::protocol::{self, MetadataCommand};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// Result artifact holding per-output type/data info.
const RESULTS_INFO: &str = "results-info";
/// Result artifact holding the captured stdout.
const STDOUT_ARTIFACT: &str = "stdout";

/// Mutable watch state for one submitted job.
#[derive(Debug, Clone)]
pub struct WatchedJob {
    /// Id of the job node in the host graph.
    pub job_id: NodeId,
    pub name: String,
    /// Remote handle from submission.
    pub info: ExecutorJobInfo,
    /// Next stdout line to fetch from the executor.
    pub last_seen_line: u64,
    /// Metadata commands already applied (survives resume).
    pub last_applied_cmd: u64,
    /// Declared output ports of the wrapped operation.
    pub output_ports: Vec<Port>,
    last_reported_status: Option<ExecutorStatus>,
}

impl WatchedJob {
    pub fn new(
        job_id: NodeId,
        name: String,
        info: ExecutorJobInfo,
        output_ports: Vec<Port>,
    ) -> Self {
        Self {
            job_id,
            name,
            info,
            last_seen_line: 0,
            last_applied_cmd: 0,
            output_ports,
            last_reported_status: None,
        }
    }
}

/// Polling state machine for submitted jobs.
pub struct JobWatcher {
    compute: Arc<dyn ComputeService>,
    blob: Arc<dyn BlobStore>,
    logs: Arc<dyn LogStore>,
    buffer: Arc<SaveBuffer>,
    poll_interval: Duration,
    canceled: watch::Receiver<bool>,
}

impl JobWatcher {
    pub fn new(
        compute: Arc<dyn ComputeService>,
        blob: Arc<dyn BlobStore>,
        logs: Arc<dyn LogStore>,
        buffer: Arc<SaveBuffer>,
        poll_interval: Duration,
        canceled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            compute,
            blob,
            logs,
            buffer,
            poll_interval,
            canceled,
        }
    }

    /// Delay before the next poll given how long this iteration took.
    /// Never negative: an overrun schedules the next poll immediately.
    pub fn next_poll_delay(interval: Duration, elapsed: Duration) -> Duration {
        interval.saturating_sub(elapsed)
    }

    /// Watches the job until it reaches a terminal state.
    ///
    /// Transient poll errors are logged and retried on the next tick;
    /// errors while handling a terminal state are fatal for this job
    /// only.
    pub async fn watch(&self, job: &mut WatchedJob) -> Result<JobOutcome> {
        info!("Watching job {} ({})", job.name, job.info.hash);

        loop {
            if *self.canceled.borrow() {
                return self.cancel_remote(job).await;
            }

            let started = Instant::now();
            match self.compute.get_info(&job.info.hash).await {
                Err(err) => {
                    warn!("Transient poll error for {}: {}", job.name, err);
                }
                Ok(info) => {
                    if let Some(output_number) = info.output_number {
                        if output_number >= job.last_seen_line {
                            if let Err(err) = self.drain_output(job, output_number).await {
                                warn!("Could not drain output for {}: {}", job.name, err);
                            }
                        }
                    }

                    match &info.status {
                        status @ (ExecutorStatus::Created | ExecutorStatus::Running) => {
                            self.report_status(job, status).await?;
                        }
                        ExecutorStatus::Success => return self.on_success(job, &info).await,
                        ExecutorStatus::Canceled => return self.on_canceled(job).await,
                        ExecutorStatus::Failed => return self.on_failed(job, None).await,
                        ExecutorStatus::Unknown(raw) => {
                            return self.on_failed(job, Some(raw.clone())).await;
                        }
                    }
                }
            }

            sleep(Self::next_poll_delay(self.poll_interval, started.elapsed())).await;
        }
    }

    /// Records non-terminal status changes (queued -> running) on the
    /// job node.
    async fn report_status(&self, job: &mut WatchedJob, status: &ExecutorStatus) -> Result<()> {
        if job.last_reported_status.as_ref() == Some(status) {
            return Ok(());
        }
        job.last_reported_status = Some(status.clone());

        let attr = match status {
            ExecutorStatus::Created => "queued",
            ExecutorStatus::Running => "running",
            _ => return Ok(()),
        };
        self.buffer.set_attribute(&job.job_id, attrs::STATUS, json!(attr));
        self.buffer
            .commit(&format!("\"{}\" is now {}", job.name, attr))
            .await?;
        Ok(())
    }

    /// Fetches lines `[last_seen, latest]` and feeds them through the
    /// command scan.
    async fn drain_output(&self, job: &mut WatchedJob, latest: u64) -> Result<()> {
        let from = job.last_seen_line;
        let to = latest + 1;
        let lines = self.compute.get_output(&job.info.hash, from, to).await?;
        if lines.is_empty() {
            return Ok(());
        }
        job.last_seen_line = to;

        let text = lines
            .iter()
            .map(|line| line.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.process_stdout(job, &text, true).await?;
        Ok(())
    }

    /// Scans a block of stdout and applies embedded metadata commands.
    ///
    /// Incremental blocks (new lines from a live poll) apply every
    /// command they contain and append the pass-through text to the
    /// job's log and stdout attribute. A replay of the full stream
    /// (after a resume) skips the commands recorded before the
    /// disconnect and rebuilds the persisted stdout wholesale instead
    /// of appending. Returns whether any command was applied.
    pub async fn process_stdout(
        &self,
        job: &mut WatchedJob,
        text: &str,
        incremental: bool,
    ) -> Result<bool> {
        let skip = if incremental { 0 } else { job.last_applied_cmd };
        let scan = protocol::scan(text, skip);

        for issue in &scan.malformed {
            warn!("Ignoring bad command from {}: {}", job.name, issue);
        }

        for command in &scan.commands {
            self.apply_metadata_command(job, command)?;
        }
        if incremental {
            job.last_applied_cmd += scan.total_commands;
        } else {
            job.last_applied_cmd = job.last_applied_cmd.max(scan.total_commands);
        }

        if !scan.stdout.is_empty() {
            if incremental {
                let existing = self
                    .buffer
                    .get_attribute(&job.job_id, attrs::STDOUT)
                    .await?
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let combined = if existing.is_empty() {
                    scan.stdout.clone()
                } else {
                    format!("{existing}\n{}", scan.stdout)
                };
                self.buffer
                    .set_attribute(&job.job_id, attrs::STDOUT, json!(combined));
                self.logs.append(&job.job_id, &scan.stdout).await?;
            } else {
                self.buffer
                    .set_attribute(&job.job_id, attrs::STDOUT, json!(scan.stdout));
                self.logs.delete(&job.job_id).await?;
                self.logs.append(&job.job_id, &scan.stdout).await?;
            }
        }

        let has_metadata = !scan.commands.is_empty();
        if has_metadata {
            self.buffer
                .commit(&format!("Updated graph/image output for {}", job.name))
                .await?;
        }
        Ok(has_metadata)
    }

    /// Catches a resumed job up on everything it printed while no
    /// orchestrator was attached: fetches the full stream, replays the
    /// metadata commands past the recorded offset and rebuilds the
    /// persisted stdout. Commands applied before the disconnect are
    /// not re-applied.
    pub async fn recover_stdout(&self, job: &mut WatchedJob) -> Result<()> {
        let info = self.compute.get_info(&job.info.hash).await?;
        let Some(latest) = info.output_number else {
            return Ok(());
        };

        let lines = self.compute.get_output(&job.info.hash, 0, latest + 1).await?;
        if lines.is_empty() {
            return Ok(());
        }
        job.last_seen_line = job.last_seen_line.max(latest + 1);

        let text = lines
            .iter()
            .map(|line| line.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if self.process_stdout(job, &text, false).await? {
            info!("Recovered graph/image output for {}", job.name);
        }
        Ok(())
    }

    fn apply_metadata_command(&self, job: &WatchedJob, command: &MetadataCommand) -> Result<()> {
        debug!(
            "Applying {} command #{} for {}",
            command.kind.keyword(),
            command.seq,
            job.name
        );
        let node = self.buffer.create_node(types::METADATA, &job.job_id)?;
        self.buffer
            .set_attribute(&node, attrs::COMMAND_ID, json!(command.seq));
        self.buffer
            .set_attribute(&node, "command", json!(command.kind.keyword()));
        self.buffer
            .set_attribute(&node, "payload", command.payload.clone());
        Ok(())
    }

    async fn on_success(&self, job: &mut WatchedJob, info: &ExecutorInfo) -> Result<JobOutcome> {
        info!("Job {} has finished (SUCCESS)", job.name);

        let results = self.fetch_results(info).await?;
        for port in &job.output_ports {
            let Some(result) = results.get(&port.name) else {
                warn!("No result reported for output {} of {}", port.name, job.name);
                continue;
            };
            if let Some(type_name) = &result.type_name {
                self.buffer
                    .set_attribute(&port.id, attrs::TYPE, json!(type_name));
            }
            if let Some(data) = &result.data {
                debug!("Setting {} data to {}", port.id, data);
                self.buffer.set_attribute(&port.id, attrs::DATA, json!(data));
            }
        }

        self.buffer
            .set_attribute(&job.job_id, attrs::STATUS, json!("success"));
        if let Err(err) = self.logs.delete(&job.job_id).await {
            warn!("Could not drop stored log for {}: {}", job.name, err);
        }
        Ok(JobOutcome::Success { results })
    }

    /// Maps declared result artifacts to per-output results. Prefers the
    /// structured results-info artifact; falls back to treating each
    /// remaining result hash as an output's data.
    async fn fetch_results(&self, info: &ExecutorInfo) -> Result<HashMap<String, ResultInfo>> {
        if let Some(hash) = info.result_hashes.get(RESULTS_INFO) {
            let raw = self.blob.get_object_string(hash).await?;
            return serde_json::from_str(&raw)
                .map_err(|err| ExecError::Host(format!("bad results-info artifact: {err}")));
        }

        Ok(info
            .result_hashes
            .iter()
            .filter(|(name, _)| *name != STDOUT_ARTIFACT && !name.ends_with("-all-files"))
            .map(|(name, hash)| {
                (
                    name.clone(),
                    ResultInfo {
                        type_name: None,
                        data: Some(hash.clone()),
                    },
                )
            })
            .collect())
    }

    async fn on_failed(
        &self,
        job: &mut WatchedJob,
        unexpected_status: Option<String>,
    ) -> Result<JobOutcome> {
        let reason = match unexpected_status {
            Some(raw) => {
                // Keep the raw status around for diagnosis
                error!("Job {} returned unexpected status {:?}", job.name, raw);
                let reason = ExecError::UnexpectedExecutorStatus(raw).to_string();
                self.buffer.set_attribute(
                    &job.job_id,
                    attrs::STDOUT,
                    json!(format!("Failed to execute operation: {reason}")),
                );
                reason
            }
            None => {
                // Surface the most precise error line available
                let stdout = self
                    .buffer
                    .get_attribute(&job.job_id, attrs::STDOUT)
                    .await?
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                stdout
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty() && line.contains("Error"))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Operation \"{}\" failed!", job.name))
            }
        };

        warn!("Job {} failed: {}", job.name, reason);
        self.buffer
            .set_attribute(&job.job_id, attrs::STATUS, json!("fail"));
        Ok(JobOutcome::Failed { reason })
    }

    async fn on_canceled(&self, job: &mut WatchedJob) -> Result<JobOutcome> {
        info!("Job {} has been canceled", job.name);

        // Keep whatever output accumulated before the cancel
        match self.logs.get(&job.job_id).await {
            Ok(stdout) if !stdout.is_empty() => {
                self.buffer
                    .set_attribute(&job.job_id, attrs::STDOUT, json!(stdout));
            }
            Ok(_) => {}
            Err(err) => warn!("Could not fetch stored log for {}: {}", job.name, err),
        }

        self.buffer
            .set_attribute(&job.job_id, attrs::STATUS, json!("canceled"));
        Ok(JobOutcome::Canceled)
    }

    /// Cancels the remote job, then records the cancellation locally.
    /// Without a secret the remote call is impossible and tracking just
    /// stops.
    async fn cancel_remote(&self, job: &mut WatchedJob) -> Result<JobOutcome> {
        match &job.info.secret {
            Some(secret) => {
                if let Err(err) = self.compute.cancel_job(&job.info.hash, secret).await {
                    warn!("Remote cancel of {} failed: {}", job.name, err);
                }
            }
            None => {
                warn!(
                    "CancellationDegraded: no secret for {}; stopping local tracking only",
                    job.name
                );
            }
        }
        self.on_canceled(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{GraphStore, MemoryGraph};
    use crate::testing::{FakeCompute, MemoryBlob, MemoryLogs};
    use forge_core::domain::NodeId;

    const INTERVAL: Duration = Duration::from_millis(1);

    struct Fixture {
        graph: Arc<MemoryGraph>,
        compute: Arc<FakeCompute>,
        logs: Arc<MemoryLogs>,
        buffer: Arc<SaveBuffer>,
        cancel_tx: watch::Sender<bool>,
        watcher: JobWatcher,
        job_id: NodeId,
        op_id: NodeId,
        out_port: NodeId,
    }

    async fn fixture() -> Fixture {
        crate::testing::init_tracing();
        let graph = Arc::new(MemoryGraph::new());
        let exec = graph.create_node("Execution", &NodeId::new()).await.unwrap();
        let job_id = graph.create_node("Job", &exec).await.unwrap();
        let op_id = graph.create_node("Operation", &job_id).await.unwrap();
        let outputs = graph.create_node("Outputs", &op_id).await.unwrap();
        let out_port = graph.create_node("Data", &outputs).await.unwrap();

        let compute = Arc::new(FakeCompute::new());
        let blob = Arc::new(MemoryBlob::new());
        let logs = Arc::new(MemoryLogs::new());
        let buffer = Arc::new(SaveBuffer::new(graph.clone()));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let watcher = JobWatcher::new(
            compute.clone(),
            blob,
            logs.clone(),
            buffer.clone(),
            INTERVAL,
            cancel_rx,
        );

        Fixture {
            graph,
            compute,
            logs,
            buffer,
            cancel_tx,
            watcher,
            job_id,
            op_id,
            out_port,
        }
    }

    fn watched(f: &Fixture, secret: Option<&str>) -> WatchedJob {
        WatchedJob::new(
            f.job_id.clone(),
            "train".to_string(),
            ExecutorJobInfo {
                hash: "job-1".to_string(),
                secret: secret.map(str::to_string),
            },
            vec![Port {
                id: f.out_port.clone(),
                name: "out".to_string(),
                operation_id: f.op_id.clone(),
                data: None,
                type_name: None,
            }],
        )
    }

    #[test]
    fn test_poll_delay_keeps_constant_cadence() {
        let interval = Duration::from_millis(1500);
        assert_eq!(
            JobWatcher::next_poll_delay(interval, Duration::ZERO),
            interval
        );
        assert_eq!(
            JobWatcher::next_poll_delay(interval, Duration::from_millis(600)),
            Duration::from_millis(900)
        );
        // Overrun: re-poll immediately, never a negative sleep
        assert_eq!(
            JobWatcher::next_poll_delay(interval, Duration::from_millis(2000)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_successful_job_writes_output_data() {
        let f = fixture().await;
        f.compute.push_info("job-1", FakeCompute::running(Some(0)));
        f.compute
            .push_info("job-1", FakeCompute::success([("out", "h1")]));
        f.compute.set_output("job-1", &["training..."]);

        let mut job = watched(&f, None);
        let outcome = f.watcher.watch(&mut job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Success { .. }));
        assert_eq!(
            f.buffer.get_attribute(&f.out_port, "data").await.unwrap(),
            Some(json!("h1"))
        );
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "status").await.unwrap(),
            Some(json!("success"))
        );
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "stdout").await.unwrap(),
            Some(json!("training..."))
        );
        // The out-of-model log is dropped once the job finishes
        assert_eq!(f.logs.stored(&f.job_id), "");
    }

    #[tokio::test]
    async fn test_failure_surfaces_last_error_line() {
        let f = fixture().await;
        f.compute.push_info("job-1", FakeCompute::running(Some(1)));
        f.compute.push_info("job-1", FakeCompute::failed());
        f.compute
            .set_output("job-1", &["starting", "ValueError: test Error here"]);

        let mut job = watched(&f, None);
        let outcome = f.watcher.watch(&mut job).await.unwrap();

        let JobOutcome::Failed { reason } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason, "ValueError: test Error here");
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "status").await.unwrap(),
            Some(json!("fail"))
        );
    }

    #[tokio::test]
    async fn test_failure_without_error_line_gets_generic_reason() {
        let f = fixture().await;
        f.compute.push_info("job-1", FakeCompute::failed());

        let mut job = watched(&f, None);
        let JobOutcome::Failed { reason } = f.watcher.watch(&mut job).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(reason, "Operation \"train\" failed!");
    }

    #[tokio::test]
    async fn test_unexpected_status_fails_the_job() {
        let f = fixture().await;
        f.compute
            .push_info("job-1", FakeCompute::status_info(ExecutorStatus::Unknown("SEGFAULT".into())));

        let mut job = watched(&f, None);
        let JobOutcome::Failed { reason } = f.watcher.watch(&mut job).await.unwrap() else {
            panic!("expected failure");
        };
        assert!(reason.contains("SEGFAULT"));
    }

    #[tokio::test]
    async fn test_cancellation_uses_secret() {
        let f = fixture().await;
        f.cancel_tx.send(true).unwrap();

        let mut job = watched(&f, Some("s3cret"));
        let outcome = f.watcher.watch(&mut job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Canceled));
        assert_eq!(
            f.compute.cancels(),
            vec![("job-1".to_string(), "s3cret".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cancellation_without_secret_degrades_locally() {
        let f = fixture().await;
        f.cancel_tx.send(true).unwrap();

        let mut job = watched(&f, None);
        let outcome = f.watcher.watch(&mut job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Canceled));
        assert!(f.compute.cancels().is_empty());
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "status").await.unwrap(),
            Some(json!("canceled"))
        );
    }

    #[tokio::test]
    async fn test_metadata_commands_are_persisted() {
        let f = fixture().await;
        f.compute.push_info("job-1", FakeCompute::running(Some(1)));
        f.compute
            .push_info("job-1", FakeCompute::status_info(ExecutorStatus::Success));
        f.compute.set_output(
            "job-1",
            &["epoch 1", "forge-cmd PLOT {\"id\": \"loss\"}"],
        );

        let mut job = watched(&f, None);
        f.watcher.watch(&mut job).await.unwrap();

        assert_eq!(job.last_applied_cmd, 1);
        // The metadata write was committed mid-run
        assert!(f.graph.commit_count() >= 1);
        let children = f.graph.load_subtree(&f.job_id).await.unwrap();
        assert!(children.iter().any(|n| n.base_type == "Metadata"));
        // The command line never reaches the stored stdout
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "stdout").await.unwrap(),
            Some(json!("epoch 1"))
        );
    }

    #[tokio::test]
    async fn test_recover_replays_only_commands_past_the_offset() {
        let f = fixture().await;
        f.compute.push_info("job-1", FakeCompute::running(Some(2)));
        f.compute.set_output(
            "job-1",
            &[
                "epoch 1",
                "forge-cmd PLOT {\"id\": \"loss\"}",
                "forge-cmd PLOT {\"id\": \"acc\"}",
            ],
        );

        let mut job = watched(&f, None);
        // The first command was applied before the disconnect
        job.last_applied_cmd = 1;
        job.last_seen_line = 1;

        f.watcher.recover_stdout(&mut job).await.unwrap();

        assert_eq!(job.last_applied_cmd, 2);
        assert_eq!(job.last_seen_line, 3);

        // Only the second command produced a metadata node
        let metadata: Vec<_> = f
            .graph
            .load_subtree(&f.job_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.base_type == "Metadata")
            .collect();
        assert_eq!(metadata.len(), 1);

        // The persisted stdout was rebuilt from the full stream
        assert_eq!(
            f.buffer.get_attribute(&f.job_id, "stdout").await.unwrap(),
            Some(json!("epoch 1"))
        );
        assert_eq!(f.logs.stored(&f.job_id), "epoch 1");
    }
}
