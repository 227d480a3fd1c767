//! Local operation primitives
//!
//! A few operation types never reach the remote executor; they run
//! in-process against the model itself (loading a stored artifact onto
//! output ports, saving an input as a new artifact, looking an artifact
//! up by name). The closed set of tags maps to handler functions
//! through a dispatch table registered at orchestrator construction.

use crate::error::{ExecError, Result};
use crate::host::{GraphNode, GraphStore};
use crate::meta::{attrs, types};
use crate::service::model;
use crate::store::SaveBuffer;
use forge_core::domain::{NodeId, OperationNode};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The closed set of local operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalOperation {
    /// Load a stored artifact's hash onto the output ports.
    ArtifactInput,
    /// Save the input hash as a named artifact node.
    ArtifactOutput,
    /// Find an artifact by name and forward its hash, if any.
    ArtifactFinder,
}

impl LocalOperation {
    pub fn from_base_type(base_type: &str) -> Option<Self> {
        match base_type {
            types::ARTIFACT_INPUT => Some(LocalOperation::ArtifactInput),
            types::ARTIFACT_OUTPUT => Some(LocalOperation::ArtifactOutput),
            types::ARTIFACT_FINDER => Some(LocalOperation::ArtifactFinder),
            _ => None,
        }
    }
}

/// Everything a handler needs to run one local operation.
pub struct LocalOpContext {
    pub op: OperationNode,
    pub job_id: NodeId,
    /// Id of the owning execution container.
    pub container_id: NodeId,
    /// Flat snapshot of the execution subtree.
    pub nodes: Arc<Vec<GraphNode>>,
    pub buffer: Arc<SaveBuffer>,
    pub graph: Arc<dyn GraphStore>,
}

pub type LocalOpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type LocalOpHandler = Arc<dyn Fn(LocalOpContext) -> LocalOpFuture + Send + Sync>;

/// Dispatch table from operation tag to handler.
pub struct LocalOpRegistry {
    handlers: HashMap<LocalOperation, LocalOpHandler>,
}

impl LocalOpRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in primitives installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(LocalOperation::ArtifactInput, |ctx| {
            Box::pin(artifact_input(ctx))
        });
        registry.register(LocalOperation::ArtifactOutput, |ctx| {
            Box::pin(artifact_output(ctx))
        });
        registry.register(LocalOperation::ArtifactFinder, |ctx| {
            Box::pin(artifact_finder(ctx))
        });
        registry
    }

    pub fn register<F>(&mut self, op: LocalOperation, handler: F)
    where
        F: Fn(LocalOpContext) -> LocalOpFuture + Send + Sync + 'static,
    {
        self.handlers.insert(op, Arc::new(handler));
    }

    pub fn handler(&self, op: LocalOperation) -> Result<LocalOpHandler> {
        self.handlers
            .get(&op)
            .cloned()
            .ok_or_else(|| ExecError::GraphConstruction(format!("no handler for {op:?}")))
    }
}

impl Default for LocalOpRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Copies the artifact hash stored on this operation onto every output
/// port.
async fn artifact_input(ctx: LocalOpContext) -> Result<()> {
    let outputs = model::ports_in(&ctx.nodes, &ctx.op.id, types::OUTPUTS);

    let hash = ctx
        .op
        .attribute_str(attrs::DATA)
        .map(str::to_string)
        .or_else(|| outputs.iter().find_map(|port| port.data.clone()));

    let Some(hash) = hash else {
        warn!("Artifact input {} has no stored data", ctx.op.name);
        return Ok(());
    };

    for port in &outputs {
        debug!("Loading blob data ({}) to {}", hash, port.id);
        ctx.buffer.set_attribute(&port.id, attrs::DATA, json!(hash));
    }
    Ok(())
}

/// Stores the first input's hash as a named artifact node under the
/// execution container.
async fn artifact_output(ctx: LocalOpContext) -> Result<()> {
    let inputs = model::ports_in(&ctx.nodes, &ctx.op.id, types::INPUTS);
    let hash = inputs.iter().find_map(|port| port.data.clone());

    let Some(hash) = hash else {
        warn!("Artifact output {} has no input data to save", ctx.op.name);
        return Ok(());
    };

    let name = ctx
        .op
        .attribute_str(attrs::SAVE_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| ctx.op.name.clone());

    info!("Saving artifact \"{}\" ({})", name, hash);
    let artifact = ctx.buffer.create_node(types::DATA, &ctx.container_id)?;
    ctx.buffer.set_attribute(&artifact, attrs::NAME, json!(name));
    ctx.buffer.set_attribute(&artifact, attrs::DATA, json!(hash));
    Ok(())
}

/// Finds a stored artifact by name and forwards its hash to the output
/// ports. A missing artifact is not an error; downstream operations
/// receive no data.
async fn artifact_finder(ctx: LocalOpContext) -> Result<()> {
    let Some(wanted) = ctx.op.attribute_str(attrs::ARTIFACT_NAME) else {
        warn!("Artifact finder {} has no artifactName", ctx.op.name);
        return Ok(());
    };

    let found = ctx.nodes.iter().find(|n| {
        n.base_type == types::DATA
            && n.attribute_str(attrs::NAME) == Some(wanted)
            && n.attribute_str(attrs::DATA).is_some()
    });

    let Some(found) = found else {
        info!("No artifact named \"{}\" found", wanted);
        return Ok(());
    };

    let hash = found.attribute_str(attrs::DATA).expect("checked above");
    for port in model::ports_in(&ctx.nodes, &ctx.op.id, types::OUTPUTS) {
        ctx.buffer.set_attribute(&port.id, attrs::DATA, json!(hash));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryGraph;

    fn graph_node(id: &str, base_type: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            base_type: base_type.to_string(),
            attributes: HashMap::new(),
            pointers: HashMap::new(),
        }
    }

    fn context(op: &GraphNode, nodes: Vec<GraphNode>) -> LocalOpContext {
        let graph = Arc::new(MemoryGraph::new());
        LocalOpContext {
            op: model::operation_view(&nodes, op),
            job_id: "/exec/a".to_string(),
            container_id: "/exec".to_string(),
            nodes: Arc::new(nodes),
            buffer: Arc::new(SaveBuffer::new(graph.clone())),
            graph,
        }
    }

    #[test]
    fn test_tag_parsing_is_closed() {
        assert_eq!(
            LocalOperation::from_base_type("Input"),
            Some(LocalOperation::ArtifactInput)
        );
        assert_eq!(LocalOperation::from_base_type("Operation"), None);
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = LocalOpRegistry::with_builtins();
        for op in [
            LocalOperation::ArtifactInput,
            LocalOperation::ArtifactOutput,
            LocalOperation::ArtifactFinder,
        ] {
            assert!(registry.handler(op).is_ok());
        }
    }

    #[test]
    fn test_missing_handler_is_an_error() {
        let registry = LocalOpRegistry::empty();
        assert!(registry.handler(LocalOperation::ArtifactInput).is_err());
    }

    #[tokio::test]
    async fn test_artifact_input_forwards_hash_to_outputs() {
        let mut op = graph_node("/exec/a/op", "Input");
        op.attributes.insert("data".to_string(), json!("art-1"));

        let nodes = vec![
            op.clone(),
            graph_node("/exec/a/op/out", "Outputs"),
            graph_node("/exec/a/op/out/p", "Data"),
        ];
        let ctx = context(&op, nodes);
        let buffer = ctx.buffer.clone();

        artifact_input(ctx).await.unwrap();
        assert_eq!(
            buffer
                .get_attribute(&"/exec/a/op/out/p".to_string(), "data")
                .await
                .unwrap(),
            Some(json!("art-1"))
        );
    }

    #[tokio::test]
    async fn test_artifact_finder_without_match_is_a_noop() {
        let mut op = graph_node("/exec/a/op", "ArtifactFinder");
        op.attributes
            .insert("artifactName".to_string(), json!("missing"));
        let nodes = vec![op.clone()];
        let ctx = context(&op, nodes);

        assert!(artifact_finder(ctx).await.is_ok());
    }
}
