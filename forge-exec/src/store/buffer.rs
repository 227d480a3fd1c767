//! Safe-save buffer
//!
//! Buffers node creations, attribute/pointer mutations and deletions
//! against a tentative overlay and commits them atomically. Created
//! nodes get temporary ids immediately (no host round-trip); at commit
//! time the creations are materialized in dependency tiers so a node
//! whose parent is itself pending is created after that parent, and
//! every buffered reference is rewritten to the real id.
//!
//! Reads are read-your-writes: a buffered value wins over the stored
//! one. Deleting an attribute buffers a reset: reading it afterwards
//! yields the value inherited from the node's base type, not the
//! pre-deletion value.
//!
//! Commits are serialized; a `commit()` issued while another is in
//! flight waits for it.

use crate::error::{ExecError, Result};
use crate::host::{CommitStatus, GraphStore};
use forge_core::domain::NodeId;
use serde_json::Value as AttrValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Reserved prefix distinguishing temporary ids from real node ids.
pub const CREATE_PREFIX: &str = "created_node_";

/// Whether `id` is a temporary id issued by [`SaveBuffer::create_node`].
pub fn is_create_id(id: &str) -> bool {
    id.starts_with(CREATE_PREFIX)
}

/// A long-lived map of node references that must be rewritten when a
/// temporary id resolves to a real one.
pub trait NodeCache: Send {
    fn rewrite(&mut self, temp_id: &NodeId, real_id: &NodeId);
}

/// Shared string-keyed map of node ids, usable as a [`NodeCache`].
#[derive(Clone, Default)]
pub struct SharedNodeMap {
    inner: Arc<StdMutex<HashMap<String, NodeId>>>,
}

impl SharedNodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, node: NodeId) {
        self.inner.lock().unwrap().insert(key.into(), node);
    }

    pub fn get(&self, key: &str) -> Option<NodeId> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<NodeId> {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn entries(&self) -> Vec<(String, NodeId)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl NodeCache for SharedNodeMap {
    fn rewrite(&mut self, temp_id: &NodeId, real_id: &NodeId) {
        let mut map = self.inner.lock().unwrap();
        for value in map.values_mut() {
            if value == temp_id {
                *value = real_id.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NodeChanges {
    /// `None` buffers an attribute reset (delete).
    attrs: HashMap<String, Option<AttrValue>>,
    ptrs: HashMap<String, Option<NodeId>>,
}

#[derive(Debug, Clone)]
struct PendingCreation {
    base_type: String,
    parent: NodeId,
}

#[derive(Default)]
struct BufferState {
    next_create_id: u64,
    creations: HashMap<NodeId, PendingCreation>,
    /// Base types of not-yet-resolved created nodes, for inherited reads.
    created_types: HashMap<NodeId, String>,
    changes: HashMap<NodeId, NodeChanges>,
    deletions: Vec<NodeId>,
    /// Snapshot being applied by the in-flight commit; still readable.
    current_changes: HashMap<NodeId, NodeChanges>,
    /// Every temp-to-real resolution performed so far.
    resolved: HashMap<NodeId, NodeId>,
    caches: Vec<Box<dyn NodeCache>>,
    fork_name_base: Option<String>,
    /// Set once a commit forks; the run stays on that branch.
    fork_name: Option<String>,
}

/// Outcome of a [`SaveBuffer::commit`].
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub status: CommitStatus,
    pub hash: String,
    /// Branch the run moved to, when the commit forked.
    pub fork_name: Option<String>,
    /// Temp ids materialized by this commit, mapped to their real ids.
    pub resolved: HashMap<NodeId, NodeId>,
}

/// Buffered, atomically-committing view of a [`GraphStore`].
pub struct SaveBuffer {
    graph: Arc<dyn GraphStore>,
    state: StdMutex<BufferState>,
    commit_gate: AsyncMutex<()>,
}

enum AttrRead {
    Buffered(Option<AttrValue>),
    InheritedOfType(String),
    InheritedOfNode(NodeId),
    TypeDefault(String),
    Stored(NodeId),
}

impl SaveBuffer {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self {
            graph,
            state: StdMutex::new(BufferState::default()),
            commit_gate: AsyncMutex::new(()),
        }
    }

    /// Base name used when a forked commit needs a fresh branch name.
    pub fn set_fork_name_base(&self, base: &str) {
        self.state.lock().unwrap().fork_name_base = Some(base.to_string());
    }

    /// Registers a cache to be rewritten on temp-id resolution.
    pub fn register_cache(&self, cache: Box<dyn NodeCache>) {
        self.state.lock().unwrap().caches.push(cache);
    }

    /// Buffers a node creation and returns its temporary id.
    pub fn create_node(&self, base_type: &str, parent: &NodeId) -> Result<NodeId> {
        if !self.graph.is_known_type(base_type) {
            return Err(ExecError::UnknownType(base_type.to_string()));
        }

        let mut state = self.state.lock().unwrap();
        let parent = resolve(&state, parent);
        state.next_create_id += 1;
        let id = format!("{}{}", CREATE_PREFIX, state.next_create_id);
        debug!("Creating {} of type {} in {}", id, base_type, parent);
        state
            .created_types
            .insert(id.clone(), base_type.to_string());
        state.creations.insert(
            id.clone(),
            PendingCreation {
                base_type: base_type.to_string(),
                parent,
            },
        );
        Ok(id)
    }

    /// Buffers an attribute write.
    pub fn set_attribute(&self, node: &NodeId, name: &str, value: AttrValue) {
        let mut state = self.state.lock().unwrap();
        let id = resolve(&state, node);
        state
            .changes
            .entry(id)
            .or_default()
            .attrs
            .insert(name.to_string(), Some(value));
    }

    /// Buffers an attribute reset. Subsequent reads yield the value
    /// inherited from the node's base type.
    pub fn del_attribute(&self, node: &NodeId, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = resolve(&state, node);
        state
            .changes
            .entry(id)
            .or_default()
            .attrs
            .insert(name.to_string(), None);
    }

    /// Buffers a pointer write. The target may itself be a temp id.
    pub fn set_pointer(&self, node: &NodeId, name: &str, target: Option<NodeId>) {
        let mut state = self.state.lock().unwrap();
        let id = resolve(&state, node);
        let target = target.map(|t| resolve(&state, &t));
        state
            .changes
            .entry(id)
            .or_default()
            .ptrs
            .insert(name.to_string(), target);
    }

    /// Buffers a node deletion.
    pub fn delete_node(&self, node: &NodeId) {
        let mut state = self.state.lock().unwrap();
        let id = resolve(&state, node);
        state.deletions.push(id);
    }

    /// Reads an attribute, preferring buffered values over stored ones.
    pub async fn get_attribute(&self, node: &NodeId, name: &str) -> Result<Option<AttrValue>> {
        let read = {
            let state = self.state.lock().unwrap();
            let id = resolve(&state, node);

            if state.deletions.contains(&id) {
                return Err(ExecError::Host(format!(
                    "cannot read {name} of deleted node {id}"
                )));
            }

            match buffered_attr(&state, &id, name) {
                Some(Some(value)) => AttrRead::Buffered(Some(value)),
                Some(None) => {
                    // Reset: fall back to the inherited default
                    if let Some(base_type) = state.created_types.get(&id) {
                        AttrRead::InheritedOfType(base_type.clone())
                    } else {
                        AttrRead::InheritedOfNode(id)
                    }
                }
                None => {
                    if let Some(base_type) = state.created_types.get(&id) {
                        AttrRead::TypeDefault(base_type.clone())
                    } else {
                        AttrRead::Stored(id)
                    }
                }
            }
        };

        match read {
            AttrRead::Buffered(value) => Ok(value),
            AttrRead::InheritedOfType(base_type) | AttrRead::TypeDefault(base_type) => {
                self.graph.get_type_attribute(&base_type, name).await
            }
            AttrRead::InheritedOfNode(id) => self.graph.get_inherited_attribute(&id, name).await,
            AttrRead::Stored(id) => self.graph.get_attribute(&id, name).await,
        }
    }

    /// Reads a pointer, preferring buffered values over stored ones.
    pub async fn get_pointer(&self, node: &NodeId, name: &str) -> Result<Option<NodeId>> {
        let stored = {
            let state = self.state.lock().unwrap();
            let id = resolve(&state, node);

            let buffered = state
                .changes
                .get(&id)
                .or_else(|| state.current_changes.get(&id))
                .and_then(|changes| changes.ptrs.get(name).cloned());
            match buffered {
                Some(target) => return Ok(target),
                None if state.created_types.contains_key(&id) => return Ok(None),
                None => id,
            }
        };

        self.graph.get_pointer(&stored, name).await
    }

    /// Applies all buffered work as one commit: creations in dependency
    /// tiers, then mutations, then deletions, then the host commit.
    pub async fn commit(&self, message: &str) -> Result<CommitOutcome> {
        let _gate = self.commit_gate.lock().await;

        let (creations, changes, deletions) = self.take_pending();
        info!(
            "Committing {} creations, {} changed nodes, {} deletions",
            creations.len(),
            changes.len(),
            deletions.len()
        );

        let resolved_now = self.apply_creations(creations).await?;
        let (changes, deletions) = rewrite_snapshot(changes, deletions, &resolved_now);
        self.apply_changes(&changes).await?;
        self.apply_deletions(deletions).await?;

        let result = self.graph.commit(message).await?;
        debug!("Save finished with status {:?}", result.status);

        let fork_name = match result.status {
            CommitStatus::Forked => Some(self.handle_fork().await?),
            CommitStatus::Merged => None,
        };

        self.state.lock().unwrap().current_changes.clear();

        Ok(CommitOutcome {
            status: result.status,
            hash: result.hash,
            fork_name,
            resolved: resolved_now,
        })
    }

    fn take_pending(
        &self,
    ) -> (
        HashMap<NodeId, PendingCreation>,
        HashMap<NodeId, NodeChanges>,
        Vec<NodeId>,
    ) {
        let mut state = self.state.lock().unwrap();
        let mut creations = std::mem::take(&mut state.creations);
        let changes = std::mem::take(&mut state.changes);
        let mut deletions = std::mem::take(&mut state.deletions);

        // A node created and deleted in the same batch never reaches the
        // host; cancel the creation instead.
        deletions.retain(|id| {
            if is_create_id(id) && creations.remove(id).is_some() {
                state.created_types.remove(id);
                return false;
            }
            true
        });

        state.current_changes = changes.clone();
        (creations, changes, deletions)
    }

    /// Materializes buffered creations tier by tier and rewrites every
    /// reference to the resolved ids.
    async fn apply_creations(
        &self,
        creations: HashMap<NodeId, PendingCreation>,
    ) -> Result<HashMap<NodeId, NodeId>> {
        let tiers = creation_tiers(&creations)?;
        let mut resolved_now: HashMap<NodeId, NodeId> = HashMap::new();

        for tier in tiers {
            let requests: Vec<(NodeId, String, NodeId)> = tier
                .iter()
                .map(|temp| {
                    let info = &creations[temp];
                    let parent = resolved_now
                        .get(&info.parent)
                        .unwrap_or(&info.parent)
                        .clone();
                    (temp.clone(), info.base_type.clone(), parent)
                })
                .collect();

            let batch = requests.into_iter().map(|(temp, base_type, parent)| async move {
                debug!("Applying creation of {} ({}) in {}", temp, base_type, parent);
                let real = self.graph.create_node(&base_type, &parent).await?;
                Ok::<_, ExecError>((temp, real))
            });

            for (temp, real) in futures::future::try_join_all(batch).await? {
                resolved_now.insert(temp, real);
            }
        }

        if !resolved_now.is_empty() {
            let mut state = self.state.lock().unwrap();
            for (temp, real) in &resolved_now {
                state.resolved.insert(temp.clone(), real.clone());
                state.created_types.remove(temp);
            }
            // Rewrite caches and any work buffered since the snapshot
            for (temp, real) in &resolved_now {
                for cache in state.caches.iter_mut() {
                    cache.rewrite(temp, real);
                }
            }
            let (changes, deletions) = rewrite_snapshot(
                std::mem::take(&mut state.changes),
                std::mem::take(&mut state.deletions),
                &resolved_now,
            );
            state.changes = changes;
            state.deletions = deletions;
        }

        Ok(resolved_now)
    }

    async fn apply_changes(&self, changes: &HashMap<NodeId, NodeChanges>) -> Result<()> {
        for (id, node_changes) in changes {
            if is_create_id(id) {
                // Creation canceled in this batch; nothing to apply to.
                warn!("Dropping changes for canceled creation {}", id);
                continue;
            }

            for (attr, value) in &node_changes.attrs {
                match value {
                    Some(value) => {
                        self.graph.set_attribute(id, attr, value.clone()).await?;
                    }
                    None => self.graph.del_attribute(id, attr).await?,
                }
            }

            for (ptr, target) in &node_changes.ptrs {
                if let Some(target_id) = target {
                    if is_create_id(target_id) {
                        // Target not materialized yet; defer to the next commit
                        let mut state = self.state.lock().unwrap();
                        state
                            .changes
                            .entry(id.clone())
                            .or_default()
                            .ptrs
                            .insert(ptr.clone(), Some(target_id.clone()));
                        continue;
                    }
                }
                self.graph.set_pointer(id, ptr, target.clone()).await?;
            }
        }
        Ok(())
    }

    async fn apply_deletions(&self, deletions: Vec<NodeId>) -> Result<()> {
        for id in deletions {
            if is_create_id(&id) {
                // Still unresolved; keep it for a later commit
                self.state.lock().unwrap().deletions.push(id);
                continue;
            }
            self.graph.delete_node(&id).await?;
        }
        Ok(())
    }

    /// Picks a fresh branch name and moves the working branch onto it.
    async fn handle_fork(&self) -> Result<String> {
        let base = self
            .state
            .lock()
            .unwrap()
            .fork_name_base
            .clone()
            .unwrap_or_else(|| "execution".to_string());
        let base = format!("{}_fork", base.replace(['-', ' '], "_"));

        let branches = self.graph.branches().await?;
        let mut name = base.clone();
        let mut suffix = 2;
        while branches.contains(&name) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }

        warn!("Commit forked; continuing on branch {}", name);
        self.graph.rename_branch(&name).await?;
        self.state.lock().unwrap().fork_name = Some(name.clone());
        Ok(name)
    }

    /// Branch this run forked onto, if any commit forked.
    pub fn current_fork(&self) -> Option<String> {
        self.state.lock().unwrap().fork_name.clone()
    }
}

fn resolve(state: &BufferState, id: &NodeId) -> NodeId {
    state.resolved.get(id).cloned().unwrap_or_else(|| id.clone())
}

fn buffered_attr(state: &BufferState, id: &NodeId, name: &str) -> Option<Option<AttrValue>> {
    for changes in [state.changes.get(id), state.current_changes.get(id)] {
        if let Some(value) = changes.and_then(|c| c.attrs.get(name)) {
            return Some(value.clone());
        }
    }
    None
}

/// Orders temp ids so every node lands after its pending parent.
///
/// Kahn's algorithm over the parent edges: tier 0 holds creations whose
/// parent already exists; tier k holds creations whose parent resolves
/// in an earlier tier. A round that places nothing means the remaining
/// parents can never exist.
fn creation_tiers(creations: &HashMap<NodeId, PendingCreation>) -> Result<Vec<Vec<NodeId>>> {
    let mut remaining: Vec<NodeId> = creations.keys().cloned().collect();
    remaining.sort_by_key(|id| create_index(id));

    let mut placed: HashSet<NodeId> = HashSet::new();
    let mut tiers = Vec::new();

    while !remaining.is_empty() {
        let (tier, rest): (Vec<NodeId>, Vec<NodeId>) = remaining.into_iter().partition(|id| {
            let parent = &creations[id].parent;
            !is_create_id(parent) || placed.contains(parent)
        });

        if tier.is_empty() {
            return Err(ExecError::UnresolvableCreationOrder(rest.join(", ")));
        }

        placed.extend(tier.iter().cloned());
        tiers.push(tier);
        remaining = rest;
    }

    Ok(tiers)
}

fn create_index(id: &str) -> u64 {
    id[CREATE_PREFIX.len()..].parse().unwrap_or(u64::MAX)
}

fn rewrite_snapshot(
    changes: HashMap<NodeId, NodeChanges>,
    deletions: Vec<NodeId>,
    resolved: &HashMap<NodeId, NodeId>,
) -> (HashMap<NodeId, NodeChanges>, Vec<NodeId>) {
    let remap = |id: NodeId| resolved.get(&id).cloned().unwrap_or(id);

    let changes = changes
        .into_iter()
        .map(|(id, mut node_changes)| {
            for target in node_changes.ptrs.values_mut() {
                if let Some(t) = target.take() {
                    *target = Some(remap(t));
                }
            }
            (remap(id), node_changes)
        })
        .collect();

    let deletions = deletions.into_iter().map(remap).collect();
    (changes, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryGraph;
    use serde_json::json;

    fn buffer() -> (Arc<MemoryGraph>, SaveBuffer) {
        let graph = Arc::new(MemoryGraph::new());
        let buffer = SaveBuffer::new(graph.clone());
        (graph, buffer)
    }

    #[tokio::test]
    async fn test_read_your_writes_before_commit() {
        let (_graph, buffer) = buffer();
        let temp = buffer.create_node("Job", &NodeId::new()).unwrap();
        buffer.set_attribute(&temp, "name", json!("train"));

        let value = buffer.get_attribute(&temp, "name").await.unwrap();
        assert_eq!(value, Some(json!("train")));
    }

    #[tokio::test]
    async fn test_commit_materializes_created_node() {
        let (graph, buffer) = buffer();
        let temp = buffer.create_node("Job", &NodeId::new()).unwrap();
        buffer.set_attribute(&temp, "name", json!("train"));

        let outcome = buffer.commit("create job").await.unwrap();
        let real = outcome.resolved.get(&temp).expect("temp id resolved");

        let node = graph.load_node(real).await.unwrap();
        assert_eq!(node.attribute_str("name"), Some("train"));

        // The old temp id keeps working after resolution
        let value = buffer.get_attribute(&temp, "name").await.unwrap();
        assert_eq!(value, Some(json!("train")));
    }

    #[tokio::test]
    async fn test_tiered_creation_resolves_parent_first() {
        let (graph, buffer) = buffer();
        let parent = buffer.create_node("Job", &NodeId::new()).unwrap();
        let child = buffer.create_node("Operation", &parent).unwrap();

        let outcome = buffer.commit("create nested").await.unwrap();
        let parent_real = outcome.resolved.get(&parent).unwrap();
        let child_real = outcome.resolved.get(&child).unwrap();

        assert!(child_real.starts_with(parent_real.as_str()));
        assert_eq!(graph.load_subtree(parent_real).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let (_graph, buffer) = buffer();
        let err = buffer.create_node("Dragon", &NodeId::new()).unwrap_err();
        assert!(matches!(err, ExecError::UnknownType(_)));
    }

    #[tokio::test]
    async fn test_deleted_attribute_reads_inherited_value() {
        let (graph, buffer) = buffer();
        graph.define_type(
            "Job",
            HashMap::from([("status".to_string(), json!("pending"))]),
        );
        let job = graph.create_node("Job", &NodeId::new()).await.unwrap();
        graph
            .set_attribute(&job, "status", json!("running"))
            .await
            .unwrap();

        buffer.del_attribute(&job, "status");

        // The reset resolves to the inherited default, not the old value
        let value = buffer.get_attribute(&job, "status").await.unwrap();
        assert_eq!(value, Some(json!("pending")));
    }

    #[tokio::test]
    async fn test_canceled_parent_makes_order_unresolvable() {
        let (_graph, buffer) = buffer();
        let parent = buffer.create_node("Job", &NodeId::new()).unwrap();
        let _child = buffer.create_node("Operation", &parent).unwrap();
        buffer.delete_node(&parent);

        let err = buffer.commit("broken").await.unwrap_err();
        assert!(matches!(err, ExecError::UnresolvableCreationOrder(_)));
    }

    #[tokio::test]
    async fn test_registered_cache_is_rewritten() {
        let (_graph, buffer) = buffer();
        let cache = SharedNodeMap::new();
        buffer.register_cache(Box::new(cache.clone()));

        let temp = buffer.create_node("Job", &NodeId::new()).unwrap();
        cache.insert("job-hash", temp.clone());

        let outcome = buffer.commit("create").await.unwrap();
        let real = outcome.resolved.get(&temp).unwrap();
        assert_eq!(cache.get("job-hash").as_ref(), Some(real));
    }

    #[tokio::test]
    async fn test_pointer_to_pending_node_resolves_on_commit() {
        let (graph, buffer) = buffer();
        let data = graph.create_node("Data", &NodeId::new()).await.unwrap();
        let temp = buffer.create_node("Job", &NodeId::new()).unwrap();
        buffer.set_pointer(&data, "provenance", Some(temp.clone()));

        let outcome = buffer.commit("link").await.unwrap();
        let real = outcome.resolved.get(&temp).unwrap();
        assert_eq!(
            graph.get_pointer(&data, "provenance").await.unwrap().as_ref(),
            Some(real)
        );
    }

    #[tokio::test]
    async fn test_forked_commit_picks_fresh_branch_name() {
        let (graph, buffer) = buffer();
        buffer.set_fork_name_base("train model");
        graph.fork_next_commit();

        let job = graph.create_node("Job", &NodeId::new()).await.unwrap();
        buffer.set_attribute(&job, "status", json!("running"));

        let outcome = buffer.commit("update").await.unwrap();
        assert_eq!(outcome.status, CommitStatus::Forked);
        assert_eq!(outcome.fork_name.as_deref(), Some("train_model_fork"));
        assert_eq!(
            graph.current_branch().await.unwrap(),
            "train_model_fork".to_string()
        );
    }

    #[tokio::test]
    async fn test_commits_are_serialized() {
        let (graph, buffer) = buffer();
        let buffer = Arc::new(buffer);
        let job = graph.create_node("Job", &NodeId::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let buffer = buffer.clone();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                buffer.set_attribute(&job, "status", json!(format!("step-{i}")));
                buffer.commit("step").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(graph.commit_count(), 4);
    }
}
