//! In-memory fakes of the host services for tests

use crate::error::{ExecError, Result};
use crate::host::{
    ArtifactSpec, BlobMetadata, BlobStore, ComputeService, LogStore, OriginService, PulseService,
};
use async_trait::async_trait;
use forge_core::dto::executor::{ExecutorInfo, ExecutorJobInfo, ExecutorStatus, OutputLine};
use forge_core::dto::origin::JobOrigin;
use forge_core::dto::pulse::Pulse;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Installs the env-filtered test subscriber (`RUST_LOG` controls
/// verbosity). Safe to call from every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted executor: queue per-job infos, the last one repeats.
pub struct FakeCompute {
    scripts: Mutex<HashMap<String, VecDeque<ExecutorInfo>>>,
    outputs: Mutex<HashMap<String, Vec<OutputLine>>>,
    submitted: Mutex<Vec<String>>,
    cancels: Mutex<Vec<(String, String)>>,
    next_job: AtomicU64,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            next_job: AtomicU64::new(0),
        }
    }

    pub fn push_info(&self, hash: &str, info: ExecutorInfo) {
        self.scripts
            .lock()
            .unwrap()
            .entry(hash.to_string())
            .or_default()
            .push_back(info);
    }

    pub fn set_output(&self, hash: &str, lines: &[&str]) {
        let lines = lines
            .iter()
            .enumerate()
            .map(|(number, content)| OutputLine {
                number: number as u64,
                content: content.to_string(),
            })
            .collect();
        self.outputs.lock().unwrap().insert(hash.to_string(), lines);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<(String, String)> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn status_info(status: ExecutorStatus) -> ExecutorInfo {
        ExecutorInfo {
            status,
            output_number: None,
            result_hashes: HashMap::new(),
        }
    }

    pub fn running(output_number: Option<u64>) -> ExecutorInfo {
        ExecutorInfo {
            status: ExecutorStatus::Running,
            output_number,
            result_hashes: HashMap::new(),
        }
    }

    pub fn success<'a>(outputs: impl IntoIterator<Item = (&'a str, &'a str)>) -> ExecutorInfo {
        ExecutorInfo {
            status: ExecutorStatus::Success,
            output_number: None,
            result_hashes: outputs
                .into_iter()
                .map(|(name, hash)| (name.to_string(), hash.to_string()))
                .collect(),
        }
    }

    pub fn failed() -> ExecutorInfo {
        Self::status_info(ExecutorStatus::Failed)
    }
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeService for FakeCompute {
    async fn create_job(&self, bundle_hash: &str) -> Result<ExecutorJobInfo> {
        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().unwrap().push(bundle_hash.to_string());
        Ok(ExecutorJobInfo {
            hash: format!("job-{n}"),
            secret: Some(format!("secret-{n}")),
        })
    }

    async fn get_info(&self, hash: &str) -> Result<ExecutorInfo> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(hash)
            .ok_or_else(|| ExecError::Host(format!("no script for job {hash}")))?;
        // The final scripted info repeats for any further polls
        if queue.len() > 1 {
            Ok(queue.pop_front().expect("checked non-empty"))
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| ExecError::Host(format!("empty script for job {hash}")))
        }
    }

    async fn get_output(&self, hash: &str, from: u64, to: u64) -> Result<Vec<OutputLine>> {
        let outputs = self.outputs.lock().unwrap();
        let lines = outputs.get(hash).cloned().unwrap_or_default();
        let from = from as usize;
        let to = (to as usize).min(lines.len());
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(lines[from..to].to_vec())
    }

    async fn cancel_job(&self, hash: &str, secret: &str) -> Result<()> {
        self.cancels
            .lock()
            .unwrap()
            .push((hash.to_string(), secret.to_string()));
        Ok(())
    }
}

/// In-memory content-addressed store.
pub struct MemoryBlob {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
    artifacts: Mutex<Vec<ArtifactSpec>>,
    next_hash: AtomicU64,
}

impl MemoryBlob {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(Vec::new()),
            next_hash: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, hash: &str, name: &str, content: &str) {
        self.objects.lock().unwrap().insert(
            hash.to_string(),
            (name.to_string(), content.as_bytes().to_vec()),
        );
    }

    pub fn saved_artifacts(&self) -> Vec<ArtifactSpec> {
        self.artifacts.lock().unwrap().clone()
    }
}

impl Default for MemoryBlob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlob {
    async fn get_metadata(&self, hash: &str) -> Result<BlobMetadata> {
        let objects = self.objects.lock().unwrap();
        let (name, content) = objects
            .get(hash)
            .ok_or_else(|| ExecError::Host(format!("no such blob: {hash}")))?;
        Ok(BlobMetadata {
            name: name.clone(),
            size: content.len() as u64,
        })
    }

    async fn get_object_string(&self, hash: &str) -> Result<String> {
        let objects = self.objects.lock().unwrap();
        let (_, content) = objects
            .get(hash)
            .ok_or_else(|| ExecError::Host(format!("no such blob: {hash}")))?;
        String::from_utf8(content.clone())
            .map_err(|_| ExecError::Host(format!("blob {hash} is not utf-8")))
    }

    async fn put_file(&self, name: &str, content: Vec<u8>) -> Result<String> {
        let n = self.next_hash.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = format!("blob-{n}");
        self.objects
            .lock()
            .unwrap()
            .insert(hash.clone(), (name.to_string(), content));
        Ok(hash)
    }

    async fn save_artifact(&self, spec: ArtifactSpec) -> Result<String> {
        let n = self.next_hash.fetch_add(1, Ordering::SeqCst) + 1;
        self.artifacts.lock().unwrap().push(spec);
        Ok(format!("artifact-{n}"))
    }
}

/// In-memory log store.
pub struct MemoryLogs {
    logs: Mutex<HashMap<String, String>>,
    counts: Mutex<HashMap<String, i64>>,
}

impl MemoryLogs {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn stored(&self, job_id: &str) -> String {
        self.logs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_line_count(&self, job_id: &str, count: i64) {
        self.counts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), count);
    }
}

impl Default for MemoryLogs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogs {
    async fn append(&self, job_id: &str, text: &str) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        let entry = logs.entry(job_id.to_string()).or_default();
        if entry.is_empty() {
            entry.push_str(text);
        } else {
            entry.push('\n');
            entry.push_str(text);
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<String> {
        Ok(self.stored(job_id))
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.logs.lock().unwrap().remove(job_id);
        self.counts.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn line_count(&self, job_id: &str) -> Result<i64> {
        if let Some(count) = self.counts.lock().unwrap().get(job_id) {
            return Ok(*count);
        }
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(job_id)
            .map(|text| text.lines().count() as i64)
            .unwrap_or(-1))
    }

    async fn fork(&self, _job_id: &str, _branch: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory pulse channel with scriptable liveness.
pub struct MemoryPulse {
    updates: Mutex<HashMap<String, u64>>,
    pulses: Mutex<HashMap<String, Pulse>>,
}

impl MemoryPulse {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(HashMap::new()),
            pulses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, run_id: &str, pulse: Pulse) {
        self.pulses.lock().unwrap().insert(run_id.to_string(), pulse);
    }

    pub fn update_count(&self, run_id: &str) -> u64 {
        self.updates
            .lock()
            .unwrap()
            .get(run_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MemoryPulse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PulseService for MemoryPulse {
    async fn update(&self, run_id: &str) -> Result<()> {
        *self
            .updates
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn check(&self, run_id: &str) -> Result<Pulse> {
        Ok(self
            .pulses
            .lock()
            .unwrap()
            .get(run_id)
            .copied()
            .unwrap_or(Pulse::DoesntExist))
    }
}

/// In-memory origin registry.
pub struct MemoryOrigin {
    origins: Mutex<HashMap<String, JobOrigin>>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, origin: JobOrigin) {
        self.origins
            .lock()
            .unwrap()
            .insert(origin.hash.clone(), origin);
    }

    pub fn recorded(&self, hash: &str) -> Option<JobOrigin> {
        self.origins.lock().unwrap().get(hash).cloned()
    }
}

impl Default for MemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OriginService for MemoryOrigin {
    async fn record(&self, origin: &JobOrigin) -> Result<()> {
        self.insert(origin.clone());
        Ok(())
    }

    async fn get_origin(&self, hash: &str) -> Result<Option<JobOrigin>> {
        Ok(self.recorded(hash))
    }

    async fn fork(&self, hash: &str, branch: &str) -> Result<()> {
        if let Some(origin) = self.origins.lock().unwrap().get_mut(hash) {
            origin.branch = branch.to_string();
        }
        Ok(())
    }
}
