//! Pipeline orchestrator
//!
//! Drives one execution to completion: builds the dependency graph,
//! dispatches every ready job (local handlers in-process, everything
//! else to the remote executor), forwards produced data to downstream
//! inputs as jobs finish and finalizes the aggregate status. Per-job
//! problems fail that job and whatever depends on it; graph
//! construction and save failures abort the run.
//!
//! One orchestrator owns one execution for the duration of a run; the
//! dependency graph and save buffer are never shared across runs.

use crate::config::Config;
use crate::error::{ExecError, Result};
use crate::host::{
    BlobStore, ComputeService, GraphNode, GraphStore, LogStore, OriginService, PulseService,
};
use crate::meta::{attrs, types};
use crate::scheduler::{
    DependencyGraph, Heartbeat, JobWatcher, ResumeDecider, ResumeDecision, WatchedJob,
};
use crate::service::bundle::BundleBuilder;
use crate::service::local::{LocalOpContext, LocalOpRegistry, LocalOperation};
use crate::service::model;
use crate::store::{SaveBuffer, SharedNodeMap};
use forge_core::domain::execution::ExecutionStatus;
use forge_core::domain::job::{Job, JobOutcome, JobStatus};
use forge_core::domain::{NodeId, OperationNode, Port};
use forge_core::dto::executor::ExecutorJobInfo;
use forge_core::dto::origin::JobOrigin;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};

/// The host services one orchestrator runs against.
#[derive(Clone)]
pub struct OrchestratorServices {
    pub graph: Arc<dyn GraphStore>,
    pub compute: Arc<dyn ComputeService>,
    pub blob: Arc<dyn BlobStore>,
    pub logs: Arc<dyn LogStore>,
    pub pulse: Arc<dyn PulseService>,
    pub origin: Arc<dyn OriginService>,
}

/// Final report of one run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub status: ExecutionStatus,
    /// Jobs that finished successfully.
    pub completed: usize,
    pub total: usize,
    /// Branch the run forked onto, when a commit conflicted.
    pub fork_name: Option<String>,
}

enum JobEvent {
    /// A remote job was submitted (or re-attached on resume).
    Submitted { hash: String },
    /// A job reached a terminal outcome.
    Done { job_id: NodeId, outcome: JobOutcome },
    /// A job could not be run at all.
    Broken { job_id: NodeId, reason: String },
}

/// Orchestrates one pipeline execution.
pub struct PipelineOrchestrator {
    services: OrchestratorServices,
    config: Config,
    buffer: Arc<SaveBuffer>,
    local_ops: Arc<LocalOpRegistry>,
    /// Remote job hash to job node id, rewritten by the save buffer.
    job_nodes: SharedNodeMap,
    cancel_tx: watch::Sender<bool>,
}

impl PipelineOrchestrator {
    pub fn new(services: OrchestratorServices, config: Config) -> Self {
        let buffer = Arc::new(SaveBuffer::new(services.graph.clone()));
        let job_nodes = SharedNodeMap::new();
        buffer.register_cache(Box::new(job_nodes.clone()));

        Self {
            services,
            config,
            buffer,
            local_ops: Arc::new(LocalOpRegistry::with_builtins()),
            job_nodes,
            cancel_tx: watch::channel(false).0,
        }
    }

    /// Replaces the local-operation dispatch table.
    pub fn with_local_ops(mut self, registry: LocalOpRegistry) -> Self {
        self.local_ops = Arc::new(registry);
        self
    }

    /// The save buffer backing this run, for callers that stage extra
    /// changes (e.g. the execution builder).
    pub fn buffer(&self) -> &Arc<SaveBuffer> {
        &self.buffer
    }

    /// Requests cooperative cancellation of the run.
    pub fn cancel(&self) {
        info!("Cancellation requested; stopping jobs");
        let _ = self.cancel_tx.send(true);
    }

    /// Runs the execution to completion and returns the final report.
    pub async fn run(&self, execution_id: &NodeId) -> Result<RunReport> {
        let nodes = Arc::new(self.services.graph.load_subtree(execution_id).await?);
        let exec_node = model::find_node(&nodes, execution_id).ok_or_else(|| {
            ExecError::GraphConstruction(format!("no execution container at {execution_id}"))
        })?;
        let exec_name = model::name_of(exec_node);
        self.buffer.set_fork_name_base(&exec_name);

        let mut deps = DependencyGraph::build(execution_id, &nodes, &[types::JOB])?;
        let total = deps.total_count();
        info!("Starting execution \"{}\" with {} jobs", exec_name, total);

        if self.config.reset_results {
            self.reset_results(&nodes);
        }
        self.buffer
            .set_attribute(execution_id, attrs::STATUS, json!("running"));
        self.buffer
            .commit(&format!("Initializing {exec_name} for execution"))
            .await?;

        let current_branch = self.services.graph.current_branch().await?;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_jobs));
        let mut heartbeat: Option<Heartbeat> = None;
        let mut statuses: HashMap<NodeId, JobStatus> = HashMap::new();
        let mut outstanding = 0usize;

        for job_id in deps.ready_set() {
            deps.mark_dispatched(&job_id);
            self.dispatch(
                job_id,
                &exec_name,
                execution_id,
                &current_branch,
                nodes.clone(),
                &event_tx,
                semaphore.clone(),
            );
            outstanding += 1;
        }

        while outstanding > 0 {
            let Some(event) = event_rx.recv().await else { break };
            match event {
                JobEvent::Submitted { hash } => {
                    if heartbeat.is_none() {
                        heartbeat = Some(Heartbeat::start(
                            self.services.pulse.clone(),
                            hash,
                            self.config.heartbeat_interval,
                        ));
                    }
                }
                JobEvent::Done { job_id, outcome } => {
                    outstanding -= 1;
                    match outcome {
                        JobOutcome::Success { .. } => {
                            statuses.insert(job_id.clone(), JobStatus::Success);
                            for next in self.complete_operation(&mut deps, &job_id).await? {
                                deps.mark_dispatched(&next);
                                self.dispatch(
                                    next,
                                    &exec_name,
                                    execution_id,
                                    &current_branch,
                                    nodes.clone(),
                                    &event_tx,
                                    semaphore.clone(),
                                );
                                outstanding += 1;
                            }
                        }
                        JobOutcome::Failed { reason } => {
                            warn!("Job {} failed: {}", job_id, reason);
                            statuses.insert(job_id, JobStatus::Fail);
                        }
                        JobOutcome::Canceled => {
                            statuses.insert(job_id, JobStatus::Canceled);
                        }
                    }
                }
                JobEvent::Broken { job_id, reason } => {
                    outstanding -= 1;
                    error!("Job {} could not run: {}", job_id, reason);
                    statuses.insert(job_id, JobStatus::Fail);
                }
            }
        }

        let report = self
            .finalize(execution_id, &exec_name, &statuses, total)
            .await;
        if let Some(mut heartbeat) = heartbeat {
            heartbeat.stop();
        }
        report
    }

    /// Clears forwarded port data and resets job statuses so the run
    /// starts from a clean slate. Source artifacts (data that no
    /// connection feeds) are left alone.
    fn reset_results(&self, nodes: &[GraphNode]) {
        info!("Clearing intermediate execution results");
        for connection in model::connections(nodes) {
            self.buffer.del_attribute(&connection.dst, attrs::DATA);
        }
        for node in nodes {
            if node.base_type == types::JOB {
                self.buffer
                    .set_attribute(&node.id, attrs::STATUS, json!("pending"));
            }
        }
    }

    /// Forwards produced data downstream and unlocks newly-ready jobs.
    async fn complete_operation(
        &self,
        deps: &mut DependencyGraph,
        job_id: &NodeId,
    ) -> Result<Vec<NodeId>> {
        for link in deps.downstream_links(job_id).to_vec() {
            let data = self.buffer.get_attribute(&link.src_port, attrs::DATA).await?;
            if let Some(data) = data {
                debug!("Forwarding data from {} to {}", link.src_port, link.dst_port);
                self.buffer.set_attribute(&link.dst_port, attrs::DATA, data);
            } else {
                warn!("No data produced at {}", link.src_port);
            }
        }

        let newly_ready = deps.on_operation_complete(job_id);
        self.buffer
            .commit(&format!("Operation at {job_id} completed successfully"))
            .await?;
        debug!(
            "{} of {} operations remaining",
            deps.total_count() - deps.completed_count(),
            deps.total_count()
        );
        Ok(newly_ready)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        job_id: NodeId,
        exec_name: &str,
        execution_id: &NodeId,
        branch: &str,
        nodes: Arc<Vec<GraphNode>>,
        event_tx: &mpsc::UnboundedSender<JobEvent>,
        semaphore: Arc<Semaphore>,
    ) {
        let task = JobTask {
            services: self.services.clone(),
            config: self.config.clone(),
            buffer: self.buffer.clone(),
            local_ops: self.local_ops.clone(),
            job_nodes: self.job_nodes.clone(),
            cancel_rx: self.cancel_tx.subscribe(),
            exec_id: execution_id.clone(),
            exec_name: exec_name.to_string(),
            branch: branch.to_string(),
            nodes,
            event_tx: event_tx.clone(),
        };

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            task.run(job_id).await;
        });
    }

    async fn finalize(
        &self,
        execution_id: &NodeId,
        exec_name: &str,
        statuses: &HashMap<NodeId, JobStatus>,
        total: usize,
    ) -> Result<RunReport> {
        let canceled = *self.cancel_tx.borrow()
            || statuses.values().any(|s| *s == JobStatus::Canceled);

        let never_dispatched = total.saturating_sub(statuses.len());
        let all_statuses = statuses
            .values()
            .copied()
            .chain(std::iter::repeat(JobStatus::Pending).take(never_dispatched));
        let mut status = ExecutionStatus::aggregate(canceled, all_statuses);
        if status == ExecutionStatus::Running {
            // Jobs stuck behind a failed dependency; never report
            // partial success
            status = ExecutionStatus::Failed;
        }

        info!("Execution \"{}\" finished: {:?}", exec_name, status);
        self.buffer
            .set_attribute(execution_id, attrs::STATUS, json!(status.as_attribute()));
        self.buffer
            .commit(&format!("Execution {exec_name} finished"))
            .await?;

        let fork_name = self.buffer.current_fork();
        if let Some(fork) = &fork_name {
            self.notify_fork(fork).await;
        }

        Ok(RunReport {
            status,
            completed: statuses
                .values()
                .filter(|s| **s == JobStatus::Success)
                .count(),
            total,
            fork_name,
        })
    }

    /// Re-points provenance and log records after the run forked.
    async fn notify_fork(&self, fork: &str) {
        for (hash, job_id) in self.job_nodes.entries() {
            if let Err(err) = self.services.origin.fork(&hash, fork).await {
                warn!("Could not fork origin of {}: {}", hash, err);
            }
            if let Err(err) = self.services.logs.fork(&job_id, fork).await {
                warn!("Could not fork logs of {}: {}", job_id, err);
            }
        }
    }
}

/// One dispatched job, running in its own task.
struct JobTask {
    services: OrchestratorServices,
    config: Config,
    buffer: Arc<SaveBuffer>,
    local_ops: Arc<LocalOpRegistry>,
    job_nodes: SharedNodeMap,
    cancel_rx: watch::Receiver<bool>,
    exec_id: NodeId,
    exec_name: String,
    branch: String,
    nodes: Arc<Vec<GraphNode>>,
    event_tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobTask {
    async fn run(self, job_id: NodeId) {
        let event = match self.execute(&job_id).await {
            Ok(outcome) => JobEvent::Done { job_id, outcome },
            Err(err) => {
                self.buffer
                    .set_attribute(&job_id, attrs::STATUS, json!("fail"));
                if let Err(commit_err) = self.buffer.commit("Job failed").await {
                    error!("Could not record job failure: {}", commit_err);
                }
                JobEvent::Broken {
                    job_id,
                    reason: err.to_string(),
                }
            }
        };
        let _ = self.event_tx.send(event);
    }

    async fn execute(&self, job_id: &NodeId) -> Result<JobOutcome> {
        let job_node = model::find_node(&self.nodes, job_id).ok_or_else(|| {
            ExecError::GraphConstruction(format!("no job node at {job_id}"))
        })?;
        let job_name = model::name_of(job_node);
        let op_node = model::operation_of_job(&self.nodes, job_id).ok_or_else(|| {
            ExecError::GraphConstruction(format!("job {job_name} has no operation"))
        })?;
        let op = model::operation_view(&self.nodes, op_node);

        debug!("Executing operation \"{}\"", job_name);
        match LocalOperation::from_base_type(&op.base_type) {
            Some(local) => self.execute_local(local, op, job_id, &job_name).await,
            None => self.execute_remote(op, job_id, &job_name).await,
        }
    }

    async fn execute_local(
        &self,
        local: LocalOperation,
        op: OperationNode,
        job_id: &NodeId,
        job_name: &str,
    ) -> Result<JobOutcome> {
        info!("Running local operation {:?} for \"{}\"", local, job_name);
        let handler = self.local_ops.handler(local)?;
        let ctx = LocalOpContext {
            op,
            job_id: job_id.clone(),
            container_id: self.exec_id.clone(),
            nodes: self.nodes.clone(),
            buffer: self.buffer.clone(),
            graph: self.services.graph.clone(),
        };

        match handler(ctx).await {
            Ok(()) => {
                self.buffer
                    .set_attribute(job_id, attrs::STATUS, json!("success"));
                self.buffer
                    .commit(&format!("\"{job_name}\" executed successfully"))
                    .await?;
                Ok(JobOutcome::Success {
                    results: HashMap::new(),
                })
            }
            Err(err) => {
                self.buffer
                    .set_attribute(job_id, attrs::STDOUT, json!(err.to_string()));
                self.buffer
                    .set_attribute(job_id, attrs::STATUS, json!("fail"));
                self.buffer
                    .commit(&format!("\"{job_name}\" failed"))
                    .await?;
                Ok(JobOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn execute_remote(
        &self,
        op: OperationNode,
        job_id: &NodeId,
        job_name: &str,
    ) -> Result<JobOutcome> {
        let output_ports = model::ports_in(&self.nodes, &op.id, types::OUTPUTS);

        let stored_status = self
            .buffer
            .get_attribute(job_id, attrs::STATUS)
            .await?
            .and_then(|v| v.as_str().map(JobStatus::from_attribute))
            .unwrap_or(JobStatus::Pending);
        let stored_info = self.stored_job_info(job_id).await?;

        let decision = if stored_status == JobStatus::Running {
            let mut snapshot = Job::new(job_id.clone(), job_name.to_string(), op.id.clone());
            snapshot.status = stored_status;
            snapshot.job_info = stored_info.clone();
            ResumeDecider::new(self.services.origin.clone(), self.services.pulse.clone())
                .should_resume(&snapshot, &self.branch)
                .await?
        } else {
            ResumeDecision::Fresh
        };

        let watcher = JobWatcher::new(
            self.services.compute.clone(),
            self.services.blob.clone(),
            self.services.logs.clone(),
            self.buffer.clone(),
            self.config.poll_interval,
            self.cancel_rx.clone(),
        );

        let mut watched = match decision {
            ResumeDecision::Resume => {
                // The decider requires a handle before deciding Resume
                let info = stored_info.ok_or_else(|| {
                    ExecError::MissingJobHandle(job_name.to_string())
                })?;
                self.reattach(&watcher, job_id, job_name, info, output_ports)
                    .await?
            }
            ResumeDecision::Fresh => {
                match self.submit(&op, job_id, job_name, output_ports).await? {
                    Some(watched) => watched,
                    None => {
                        // Submission-stage failure already recorded
                        return Ok(JobOutcome::Failed {
                            reason: format!("Could not submit \"{job_name}\""),
                        });
                    }
                }
            }
        };

        let outcome = watcher.watch(&mut watched).await?;
        self.buffer
            .commit(&format!("\"{job_name}\" finished"))
            .await?;
        Ok(outcome)
    }

    /// Fresh path: bundle, submit, record provenance. Returns `None`
    /// when the job failed at this stage (already marked on the model).
    async fn submit(
        &self,
        op: &OperationNode,
        job_id: &NodeId,
        job_name: &str,
        output_ports: Vec<Port>,
    ) -> Result<Option<WatchedJob>> {
        self.buffer
            .set_attribute(job_id, attrs::STATUS, json!("queued"));
        self.buffer.del_attribute(job_id, attrs::STDOUT);
        if let Err(err) = self.services.logs.delete(job_id).await {
            warn!("Could not clear stale log for {}: {}", job_name, err);
        }

        let bundler = BundleBuilder::new(
            self.services.blob.clone(),
            self.config.poll_interval.as_millis() as u64,
            self.config.debug_artifacts,
        );
        let bundle_hash = match bundler.build(op, job_id, &self.nodes).await {
            Ok(hash) => hash,
            Err(err @ ExecError::BlobRetrievalFailed { .. }) => {
                error!("Could not generate files for {}: {}", job_name, err);
                self.buffer.set_attribute(
                    job_id,
                    attrs::STDOUT,
                    json!(format!("Failed to execute operation: {err}")),
                );
                self.buffer
                    .set_attribute(job_id, attrs::STATUS, json!("fail"));
                self.buffer
                    .commit(&format!("Blob retrieval failed for \"{job_name}\""))
                    .await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.buffer
            .set_attribute(job_id, attrs::EXEC_FILES, json!(bundle_hash));
        self.buffer
            .commit(&format!(
                "Queued \"{}\" operation in {}",
                job_name, self.exec_name
            ))
            .await?;

        let info = match self.services.compute.create_job(&bundle_hash).await {
            Ok(info) => info,
            Err(err) => {
                let err = ExecError::RemoteSubmission {
                    job: job_name.to_string(),
                    reason: err.to_string(),
                };
                error!("{}", err);
                self.buffer
                    .set_attribute(job_id, attrs::STATUS, json!("fail"));
                self.buffer
                    .commit(&format!("Could not submit \"{job_name}\""))
                    .await?;
                return Ok(None);
            }
        };

        let info_json = serde_json::to_string(&info)
            .map_err(|err| ExecError::Host(format!("unserializable job info: {err}")))?;
        self.buffer
            .set_attribute(job_id, attrs::JOB_INFO, json!(info_json));
        self.job_nodes.insert(info.hash.clone(), job_id.clone());
        self.services
            .origin
            .record(&JobOrigin {
                hash: info.hash.clone(),
                node_id: job_id.clone(),
                job: job_name.to_string(),
                execution: self.exec_name.clone(),
                branch: self.branch.clone(),
            })
            .await?;
        self.buffer
            .commit(&format!(
                "Started \"{}\" operation in {}",
                job_name, self.exec_name
            ))
            .await?;

        let _ = self.event_tx.send(JobEvent::Submitted {
            hash: info.hash.clone(),
        });
        Ok(Some(WatchedJob::new(
            job_id.clone(),
            job_name.to_string(),
            info,
            output_ports,
        )))
    }

    /// Resume path: re-attach to the in-flight remote job, recovering
    /// the stdout position and applied-command count.
    async fn reattach(
        &self,
        watcher: &JobWatcher,
        job_id: &NodeId,
        job_name: &str,
        info: ExecutorJobInfo,
        output_ports: Vec<Port>,
    ) -> Result<WatchedJob> {
        info!("Resuming job {} ({})", job_name, job_id);
        let mut watched = WatchedJob::new(
            job_id.clone(),
            job_name.to_string(),
            info,
            output_ports,
        );

        let count = self.services.logs.line_count(job_id).await?;
        watched.last_seen_line = if count < 0 {
            warn!("No line count found for {}. Setting count to 0", job_id);
            self.services.logs.delete(job_id).await?;
            0
        } else {
            count as u64
        };
        watched.last_applied_cmd = last_applied_command(&self.nodes, job_id);

        // Catch up on output produced while no orchestrator was
        // attached; on failure, watching continues from the recorded
        // position
        if let Err(err) = watcher.recover_stdout(&mut watched).await {
            warn!("Could not recover prior output for {}: {}", job_name, err);
        }

        self.job_nodes
            .insert(watched.info.hash.clone(), job_id.clone());
        let _ = self.event_tx.send(JobEvent::Submitted {
            hash: watched.info.hash.clone(),
        });
        Ok(watched)
    }

    async fn stored_job_info(&self, job_id: &NodeId) -> Result<Option<ExecutorJobInfo>> {
        let raw = self.buffer.get_attribute(job_id, attrs::JOB_INFO).await?;
        Ok(raw
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| serde_json::from_str(&s).ok()))
    }
}

/// Highest metadata-command sequence already recorded under a job.
fn last_applied_command(nodes: &[GraphNode], job_id: &NodeId) -> u64 {
    model::direct_children(nodes, job_id)
        .into_iter()
        .filter(|n| n.base_type == types::METADATA)
        .filter_map(|n| n.attributes.get(attrs::COMMAND_ID).and_then(|v| v.as_u64()))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryGraph;
    use crate::testing::{FakeCompute, MemoryBlob, MemoryLogs, MemoryOrigin, MemoryPulse};
    use std::time::Duration;

    struct Fixture {
        graph: Arc<MemoryGraph>,
        compute: Arc<FakeCompute>,
        blob: Arc<MemoryBlob>,
        pulse: Arc<MemoryPulse>,
        origin: Arc<MemoryOrigin>,
        orchestrator: Arc<PipelineOrchestrator>,
    }

    fn fixture_with(graph: MemoryGraph, compute: FakeCompute) -> Fixture {
        crate::testing::init_tracing();
        let graph = Arc::new(graph);
        let compute = Arc::new(compute);
        let blob = Arc::new(MemoryBlob::new());
        let pulse = Arc::new(MemoryPulse::new());
        let origin = Arc::new(MemoryOrigin::new());
        let services = OrchestratorServices {
            graph: graph.clone(),
            compute: compute.clone(),
            blob: blob.clone(),
            logs: Arc::new(MemoryLogs::new()),
            pulse: pulse.clone(),
            origin: origin.clone(),
        };
        let config = Config::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_heartbeat_interval(Duration::from_millis(2));
        let orchestrator = Arc::new(PipelineOrchestrator::new(services, config));

        Fixture {
            graph,
            compute,
            blob,
            pulse,
            origin,
            orchestrator,
        }
    }

    /// Remote jobs a -> b; a produces output port "out", b consumes
    /// through input port "in".
    fn two_op_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        graph.insert_node("/exec", "Execution", "");
        graph.set_attr("/exec", "name", json!("run1"));

        graph.insert_node("/exec/a", "Job", "/exec");
        graph.set_attr("/exec/a", "name", json!("opA"));
        graph.insert_node("/exec/a/op", "Operation", "/exec/a");
        graph.set_attr("/exec/a/op", "name", json!("opA"));
        graph.insert_node("/exec/a/op/out", "Outputs", "/exec/a/op");
        graph.insert_node("/exec/a/op/out/p", "Data", "/exec/a/op/out");
        graph.set_attr("/exec/a/op/out/p", "name", json!("out"));

        graph.insert_node("/exec/b", "Job", "/exec");
        graph.set_attr("/exec/b", "name", json!("opB"));
        graph.insert_node("/exec/b/op", "Operation", "/exec/b");
        graph.set_attr("/exec/b/op", "name", json!("opB"));
        graph.insert_node("/exec/b/op/in", "Inputs", "/exec/b/op");
        graph.insert_node("/exec/b/op/in/p", "Data", "/exec/b/op/in");
        graph.set_attr("/exec/b/op/in/p", "name", json!("in"));

        graph.insert_node("/exec/c1", "Connection", "/exec");
        graph.set_ptr("/exec/c1", "src", Some("/exec/a/op/out/p"));
        graph.set_ptr("/exec/c1", "dst", Some("/exec/b/op/in/p"));
        graph
    }

    async fn attr(graph: &MemoryGraph, id: &str, name: &str) -> Option<serde_json::Value> {
        graph.get_attribute(&id.to_string(), name).await.unwrap()
    }

    #[tokio::test]
    async fn test_two_op_pipeline_forwards_data_downstream() {
        let compute = FakeCompute::new();
        // a is dispatched first, so it becomes job-1
        compute.push_info("job-1", FakeCompute::success([("out", "h1")]));
        compute.push_info(
            "job-2",
            FakeCompute::status_info(forge_core::dto::executor::ExecutorStatus::Success),
        );
        let f = fixture_with(two_op_graph(), compute);
        // The hash a produces must be resolvable when b's bundle is built
        f.blob.insert("h1", "x.dat", "serialized value");

        let report = f.orchestrator.run(&"/exec".to_string()).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Success);
        assert_eq!(report.completed, 2);
        assert_eq!(report.total, 2);

        // a's output was forwarded to b's input before b ran
        assert_eq!(
            attr(&f.graph, "/exec/b/op/in/p", "data").await,
            Some(json!("h1"))
        );
        assert_eq!(attr(&f.graph, "/exec/a", "status").await, Some(json!("success")));
        assert_eq!(attr(&f.graph, "/exec/b", "status").await, Some(json!("success")));
        assert_eq!(attr(&f.graph, "/exec", "status").await, Some(json!("success")));

        // Both jobs went through the executor, origin was recorded and
        // the heartbeat ran under the first job's hash
        assert_eq!(f.compute.submitted().len(), 2);
        assert!(f.origin.recorded("job-1").is_some());
        assert!(f.pulse.update_count("job-1") >= 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_the_execution() {
        let compute = FakeCompute::new();
        compute.push_info("job-1", FakeCompute::failed());
        let f = fixture_with(two_op_graph(), compute);

        let report = f.orchestrator.run(&"/exec".to_string()).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.completed, 0);
        assert_eq!(attr(&f.graph, "/exec/a", "status").await, Some(json!("fail")));
        // b was never dispatched
        assert_eq!(
            attr(&f.graph, "/exec/b", "status").await,
            Some(json!("pending"))
        );
        assert_eq!(attr(&f.graph, "/exec", "status").await, Some(json!("failed")));
        assert_eq!(f.compute.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_cancels_running_jobs() {
        let compute = FakeCompute::new();
        // a never finishes on its own
        compute.push_info("job-1", FakeCompute::running(None));
        let f = fixture_with(two_op_graph(), compute);

        let orchestrator = f.orchestrator.clone();
        let handle =
            tokio::spawn(async move { orchestrator.run(&"/exec".to_string()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.orchestrator.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.status, ExecutionStatus::Canceled);
        assert_eq!(attr(&f.graph, "/exec", "status").await, Some(json!("canceled")));
        // The remote job was canceled with its secret
        let cancels = f.compute.cancels();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].0, "job-1");
    }

    #[tokio::test]
    async fn test_local_operation_runs_without_executor() {
        let graph = MemoryGraph::new();
        graph.insert_node("/exec", "Execution", "");
        graph.set_attr("/exec", "name", json!("run1"));
        graph.insert_node("/exec/a", "Job", "/exec");
        graph.set_attr("/exec/a", "name", json!("load"));
        graph.insert_node("/exec/a/op", "Input", "/exec/a");
        graph.set_attr("/exec/a/op", "name", json!("load"));
        graph.set_attr("/exec/a/op", "data", json!("art-9"));
        graph.insert_node("/exec/a/op/out", "Outputs", "/exec/a/op");
        graph.insert_node("/exec/a/op/out/p", "Data", "/exec/a/op/out");
        graph.set_attr("/exec/a/op/out/p", "name", json!("artifact"));

        let f = fixture_with(graph, FakeCompute::new());
        let report = f.orchestrator.run(&"/exec".to_string()).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Success);
        assert!(f.compute.submitted().is_empty());
        assert_eq!(
            attr(&f.graph, "/exec/a/op/out/p", "data").await,
            Some(json!("art-9"))
        );
    }

    #[tokio::test]
    async fn test_reset_clears_forwarded_data_only() {
        let graph = two_op_graph();
        // Stale forwarded value on b's input, source data on a's output
        graph.set_attr("/exec/b/op/in/p", "data", json!("stale"));
        graph.set_attr("/exec/a/op/out/p", "data", json!("source"));
        let compute = FakeCompute::new();
        compute.push_info("job-1", FakeCompute::failed());
        let f = fixture_with(graph, compute);

        f.orchestrator.run(&"/exec".to_string()).await.unwrap();

        // Destination port was cleared by the reset; a's own (source)
        // data survived
        assert_eq!(attr(&f.graph, "/exec/b/op/in/p", "data").await, None);
        assert_eq!(
            attr(&f.graph, "/exec/a/op/out/p", "data").await,
            Some(json!("source"))
        );
    }

    #[tokio::test]
    async fn test_running_job_with_dead_pulse_is_resumed() {
        crate::testing::init_tracing();
        let graph = MemoryGraph::new();
        graph.insert_node("/exec", "Execution", "");
        graph.set_attr("/exec", "name", json!("run1"));
        graph.insert_node("/exec/a", "Job", "/exec");
        graph.set_attr("/exec/a", "name", json!("opA"));
        // Left over from a disconnected session
        graph.set_attr("/exec/a", "status", json!("running"));
        graph.set_attr("/exec/a", "jobInfo", json!("{\"hash\":\"job-1\"}"));
        graph.insert_node("/exec/a/op", "Operation", "/exec/a");
        graph.set_attr("/exec/a/op", "name", json!("opA"));
        graph.insert_node("/exec/a/op/out", "Outputs", "/exec/a/op");
        graph.insert_node("/exec/a/op/out/p", "Data", "/exec/a/op/out");
        graph.set_attr("/exec/a/op/out/p", "name", json!("out"));

        let graph = Arc::new(graph);
        let compute = Arc::new(FakeCompute::new());
        compute.push_info("job-1", FakeCompute::success([("out", "h9")]));
        let logs = Arc::new(MemoryLogs::new());
        logs.set_line_count("/exec/a", 2);
        let origin = Arc::new(MemoryOrigin::new());
        origin.insert(JobOrigin {
            hash: "job-1".to_string(),
            node_id: "/exec/a".to_string(),
            job: "opA".to_string(),
            execution: "run1".to_string(),
            branch: "master".to_string(),
        });

        let services = OrchestratorServices {
            graph: graph.clone(),
            compute: compute.clone(),
            blob: Arc::new(MemoryBlob::new()),
            logs,
            // No pulse entry for job-1: the previous owner is gone
            pulse: Arc::new(MemoryPulse::new()),
            origin,
        };
        let config = Config::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_heartbeat_interval(Duration::from_millis(2))
            .with_reset_results(false);
        let orchestrator = PipelineOrchestrator::new(services, config);

        let report = orchestrator.run(&"/exec".to_string()).await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Success);
        // Re-attached to the in-flight job; nothing was resubmitted
        assert!(compute.submitted().is_empty());
        assert_eq!(
            attr(&graph, "/exec/a/op/out/p", "data").await,
            Some(json!("h9"))
        );
    }
}
