//! In-memory graph store
//!
//! A `GraphStore` backed by a process-local node table. Used by tests
//! and local (non-versioned) runs; commits are recorded but never
//! conflict unless a fork is explicitly injected.

use crate::error::{ExecError, Result};
use crate::host::{CommitResult, CommitStatus, GraphNode, GraphStore};
use async_trait::async_trait;
use forge_core::domain::NodeId;
use serde_json::Value as AttrValue;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredNode {
    id: NodeId,
    base_type: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: HashMap<String, AttrValue>,
    pointers: HashMap<String, Option<NodeId>>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<NodeId, StoredNode>,
    /// Meta type name to inherited attribute defaults.
    meta: HashMap<String, HashMap<String, AttrValue>>,
    branch: String,
    branches: Vec<String>,
    next_id: u64,
    commit_count: u64,
    fork_next_commit: bool,
}

/// In-memory implementation of [`GraphStore`].
///
/// Node ids are slash-separated paths so sibling-containment lookups
/// behave like they do against the real host graph.
pub struct MemoryGraph {
    state: Mutex<GraphState>,
}

impl MemoryGraph {
    /// Creates an empty graph with the standard meta vocabulary and a
    /// root node `""`.
    pub fn new() -> Self {
        let mut state = GraphState {
            branch: "master".to_string(),
            branches: vec!["master".to_string()],
            ..Default::default()
        };

        for type_name in [
            crate::meta::types::PIPELINE,
            crate::meta::types::EXECUTION,
            crate::meta::types::JOB,
            crate::meta::types::OPERATION,
            crate::meta::types::INPUTS,
            crate::meta::types::OUTPUTS,
            crate::meta::types::DATA,
            crate::meta::types::CONNECTION,
            crate::meta::types::METADATA,
            crate::meta::types::ARTIFACT_INPUT,
            crate::meta::types::ARTIFACT_OUTPUT,
            crate::meta::types::ARTIFACT_FINDER,
        ] {
            state.meta.insert(type_name.to_string(), HashMap::new());
        }

        state.nodes.insert(
            NodeId::new(),
            StoredNode {
                id: NodeId::new(),
                base_type: "Root".to_string(),
                parent: None,
                children: Vec::new(),
                attributes: HashMap::new(),
                pointers: HashMap::new(),
            },
        );

        Self {
            state: Mutex::new(state),
        }
    }

    /// Registers (or extends) a meta type with inherited defaults.
    pub fn define_type(&self, base_type: &str, defaults: HashMap<String, AttrValue>) {
        let mut state = self.state.lock().unwrap();
        state
            .meta
            .entry(base_type.to_string())
            .or_default()
            .extend(defaults);
    }

    /// Inserts a node with a caller-chosen id. Fixture helper; the id
    /// must extend its parent's path.
    pub fn insert_node(&self, id: &str, base_type: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(
            id.to_string(),
            StoredNode {
                id: id.to_string(),
                base_type: base_type.to_string(),
                parent: Some(parent.to_string()),
                children: Vec::new(),
                attributes: HashMap::new(),
                pointers: HashMap::new(),
            },
        );
        if let Some(parent) = state.nodes.get_mut(parent) {
            parent.children.push(id.to_string());
        }
    }

    /// Sets an attribute synchronously. Fixture helper.
    pub fn set_attr(&self, id: &str, name: &str, value: AttrValue) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(id) {
            node.attributes.insert(name.to_string(), value);
        }
    }

    /// Sets a pointer synchronously. Fixture helper.
    pub fn set_ptr(&self, id: &str, name: &str, target: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(id) {
            node.pointers
                .insert(name.to_string(), target.map(|t| t.to_string()));
        }
    }

    /// Makes the next commit report `Forked`.
    pub fn fork_next_commit(&self) {
        self.state.lock().unwrap().fork_next_commit = true;
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().unwrap().commit_count
    }

    fn to_graph_node(node: &StoredNode) -> GraphNode {
        GraphNode {
            id: node.id.clone(),
            base_type: node.base_type.clone(),
            attributes: node.attributes.clone(),
            pointers: node.pointers.clone(),
        }
    }

    fn collect_subtree(state: &GraphState, id: &NodeId, out: &mut Vec<GraphNode>) {
        if let Some(node) = state.nodes.get(id) {
            out.push(Self::to_graph_node(node));
            for child in &node.children {
                Self::collect_subtree(state, child, out);
            }
        }
    }

    fn missing(id: &NodeId) -> ExecError {
        ExecError::Host(format!("no such node: {id:?}"))
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn load_subtree(&self, node: &NodeId) -> Result<Vec<GraphNode>> {
        let state = self.state.lock().unwrap();
        if !state.nodes.contains_key(node) {
            return Err(Self::missing(node));
        }
        let mut out = Vec::new();
        Self::collect_subtree(&state, node, &mut out);
        Ok(out)
    }

    async fn load_node(&self, node: &NodeId) -> Result<GraphNode> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(node)
            .map(Self::to_graph_node)
            .ok_or_else(|| Self::missing(node))
    }

    async fn create_node(&self, base_type: &str, parent: &NodeId) -> Result<NodeId> {
        let mut state = self.state.lock().unwrap();
        if !state.meta.contains_key(base_type) {
            return Err(ExecError::UnknownType(base_type.to_string()));
        }
        if !state.nodes.contains_key(parent) {
            return Err(Self::missing(parent));
        }

        state.next_id += 1;
        let id = format!("{}/n{}", parent, state.next_id);
        state.nodes.insert(
            id.clone(),
            StoredNode {
                id: id.clone(),
                base_type: base_type.to_string(),
                parent: Some(parent.clone()),
                children: Vec::new(),
                attributes: HashMap::new(),
                pointers: HashMap::new(),
            },
        );
        state
            .nodes
            .get_mut(parent)
            .expect("parent checked above")
            .children
            .push(id.clone());
        Ok(id)
    }

    async fn get_attribute(&self, node: &NodeId, name: &str) -> Result<Option<AttrValue>> {
        let state = self.state.lock().unwrap();
        let stored = state.nodes.get(node).ok_or_else(|| Self::missing(node))?;
        if let Some(value) = stored.attributes.get(name) {
            return Ok(Some(value.clone()));
        }
        Ok(state
            .meta
            .get(&stored.base_type)
            .and_then(|defaults| defaults.get(name))
            .cloned())
    }

    async fn get_inherited_attribute(
        &self,
        node: &NodeId,
        name: &str,
    ) -> Result<Option<AttrValue>> {
        let state = self.state.lock().unwrap();
        let stored = state.nodes.get(node).ok_or_else(|| Self::missing(node))?;
        Ok(state
            .meta
            .get(&stored.base_type)
            .and_then(|defaults| defaults.get(name))
            .cloned())
    }

    async fn get_type_attribute(&self, base_type: &str, name: &str) -> Result<Option<AttrValue>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .meta
            .get(base_type)
            .and_then(|defaults| defaults.get(name))
            .cloned())
    }

    async fn set_attribute(&self, node: &NodeId, name: &str, value: AttrValue) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Self::missing(node))?;
        stored.attributes.insert(name.to_string(), value);
        Ok(())
    }

    async fn del_attribute(&self, node: &NodeId, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Self::missing(node))?;
        stored.attributes.remove(name);
        Ok(())
    }

    async fn get_pointer(&self, node: &NodeId, name: &str) -> Result<Option<NodeId>> {
        let state = self.state.lock().unwrap();
        let stored = state.nodes.get(node).ok_or_else(|| Self::missing(node))?;
        Ok(stored.pointers.get(name).cloned().flatten())
    }

    async fn set_pointer(&self, node: &NodeId, name: &str, target: Option<NodeId>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| Self::missing(node))?;
        stored.pointers.insert(name.to_string(), target);
        Ok(())
    }

    async fn delete_node(&self, node: &NodeId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.nodes.remove(node) else {
            return Ok(()); // already gone
        };
        if let Some(parent) = stored.parent.as_ref().and_then(|p| state.nodes.get_mut(p)) {
            parent.children.retain(|c| c != node);
        }
        // Drop the subtree as well
        let mut pending = stored.children;
        while let Some(id) = pending.pop() {
            if let Some(removed) = state.nodes.remove(&id) {
                pending.extend(removed.children);
            }
        }
        Ok(())
    }

    async fn commit(&self, _message: &str) -> Result<CommitResult> {
        let mut state = self.state.lock().unwrap();
        state.commit_count += 1;
        let status = if state.fork_next_commit {
            state.fork_next_commit = false;
            CommitStatus::Forked
        } else {
            CommitStatus::Merged
        };
        Ok(CommitResult {
            status,
            hash: format!("commit-{}", state.commit_count),
        })
    }

    async fn branches(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().branches.clone())
    }

    async fn current_branch(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().branch.clone())
    }

    async fn rename_branch(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let old = state.branch.clone();
        state.branch = name.to_string();
        state.branches.retain(|b| b != &old);
        state.branches.push(name.to_string());
        Ok(())
    }

    fn is_known_type(&self, base_type: &str) -> bool {
        self.state.lock().unwrap().meta.contains_key(base_type)
    }
}
