//! Host service contracts
//!
//! The orchestrator does not own a graph database, a blob store or an
//! executor; it consumes them through the narrow traits defined here.
//! `forge-client` provides HTTP implementations for the remote services
//! and [`MemoryGraph`] provides an in-process graph for tests and local
//! runs.

pub mod memory;
pub mod remote;

use crate::error::Result;
use async_trait::async_trait;
use forge_core::domain::NodeId;
use forge_core::dto::executor::{ExecutorInfo, ExecutorJobInfo, OutputLine};
use forge_core::dto::origin::JobOrigin;
use forge_core::dto::pulse::Pulse;
use serde_json::Value as AttrValue;
use std::collections::HashMap;

pub use memory::MemoryGraph;

/// Flat view of one node loaded from the host graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    /// Name of the meta type this node is an instance of.
    pub base_type: String,
    pub attributes: HashMap<String, AttrValue>,
    pub pointers: HashMap<String, Option<NodeId>>,
}

impl GraphNode {
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }

    pub fn pointer(&self, name: &str) -> Option<&NodeId> {
        self.pointers.get(name).and_then(|t| t.as_ref())
    }
}

/// Result of committing buffered changes to the versioned store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The commit landed on the working branch.
    Merged,
    /// Concurrent edits forced the commit onto a fork.
    Forked,
}

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub status: CommitStatus,
    pub hash: String,
}

/// Versioned graph store holding the pipeline/execution model.
///
/// Mirrors the host's node CRUD and commit/branch model; fork-on-conflict
/// is surfaced through [`CommitStatus::Forked`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Loads a node and all of its descendants, flattened.
    async fn load_subtree(&self, node: &NodeId) -> Result<Vec<GraphNode>>;

    async fn load_node(&self, node: &NodeId) -> Result<GraphNode>;

    async fn create_node(&self, base_type: &str, parent: &NodeId) -> Result<NodeId>;

    async fn get_attribute(&self, node: &NodeId, name: &str) -> Result<Option<AttrValue>>;

    /// The value inherited from the node's base, ignoring any override
    /// on the node itself.
    async fn get_inherited_attribute(&self, node: &NodeId, name: &str)
    -> Result<Option<AttrValue>>;

    /// The default value an instance of `base_type` would inherit.
    async fn get_type_attribute(&self, base_type: &str, name: &str) -> Result<Option<AttrValue>>;

    async fn set_attribute(&self, node: &NodeId, name: &str, value: AttrValue) -> Result<()>;

    async fn del_attribute(&self, node: &NodeId, name: &str) -> Result<()>;

    async fn get_pointer(&self, node: &NodeId, name: &str) -> Result<Option<NodeId>>;

    async fn set_pointer(&self, node: &NodeId, name: &str, target: Option<NodeId>) -> Result<()>;

    async fn delete_node(&self, node: &NodeId) -> Result<()>;

    /// Commits everything applied since the last commit.
    async fn commit(&self, message: &str) -> Result<CommitResult>;

    async fn branches(&self) -> Result<Vec<String>>;

    async fn current_branch(&self) -> Result<String>;

    /// Renames the working branch (after a fork).
    async fn rename_branch(&self, name: &str) -> Result<()>;

    /// Whether `base_type` names a meta type instances can be created of.
    fn is_known_type(&self, base_type: &str) -> bool;
}

/// Remote job executor.
#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn create_job(&self, bundle_hash: &str) -> Result<ExecutorJobInfo>;

    async fn get_info(&self, hash: &str) -> Result<ExecutorInfo>;

    /// Stdout lines in `[from, to)`.
    async fn get_output(&self, hash: &str, from: u64, to: u64) -> Result<Vec<OutputLine>>;

    async fn cancel_job(&self, hash: &str, secret: &str) -> Result<()>;
}

/// Metadata of a stored blob.
#[derive(Debug, Clone)]
pub struct BlobMetadata {
    pub name: String,
    pub size: u64,
}

/// Buildable artifact: named files plus references to already-stored
/// content.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSpec {
    pub name: String,
    pub files: HashMap<String, Vec<u8>>,
    pub object_hashes: HashMap<String, String>,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn add_object_hash(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        self.object_hashes.insert(path.into(), hash.into());
    }
}

/// Content-addressed artifact storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_metadata(&self, hash: &str) -> Result<BlobMetadata>;

    async fn get_object_string(&self, hash: &str) -> Result<String>;

    async fn put_file(&self, name: &str, content: Vec<u8>) -> Result<String>;

    /// Stores the artifact and returns its content hash.
    async fn save_artifact(&self, spec: ArtifactSpec) -> Result<String>;
}

/// TTL-based liveness channel keyed by run id.
#[async_trait]
pub trait PulseService: Send + Sync {
    async fn update(&self, run_id: &str) -> Result<()>;

    async fn check(&self, run_id: &str) -> Result<Pulse>;
}

/// Registry recording which node/branch each remote job was started from.
#[async_trait]
pub trait OriginService: Send + Sync {
    async fn record(&self, origin: &JobOrigin) -> Result<()>;

    /// `None` when no origin was recorded for the hash.
    async fn get_origin(&self, hash: &str) -> Result<Option<JobOrigin>>;

    async fn fork(&self, hash: &str, branch: &str) -> Result<()>;
}

/// Out-of-model store for job stdout.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, job_id: &str, text: &str) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<String>;

    async fn delete(&self, job_id: &str) -> Result<()>;

    /// Stored line count, or -1 when unknown.
    async fn line_count(&self, job_id: &str) -> Result<i64>;

    async fn fork(&self, job_id: &str, branch: &str) -> Result<()>;
}
