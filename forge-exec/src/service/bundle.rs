//! Execution bundle assembly
//!
//! A remote job is submitted as one content-addressed artifact holding
//! everything the executor needs: the operation's attribute table, its
//! input data (by hash), pointer targets (by hash) and the executor
//! config describing which result artifacts to collect.

use crate::error::{ExecError, Result};
use crate::host::{ArtifactSpec, BlobStore, GraphNode};
use crate::meta::{attrs, pointers, types};
use crate::service::model;
use forge_core::domain::{NodeId, OperationNode};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result artifact name for the captured stdout.
const STDOUT_ARTIFACT: &str = "stdout";

/// Assembles execution bundles for remote operations.
pub struct BundleBuilder {
    blob: Arc<dyn BlobStore>,
    output_interval_ms: u64,
    debug_artifacts: bool,
}

impl BundleBuilder {
    pub fn new(blob: Arc<dyn BlobStore>, output_interval_ms: u64, debug_artifacts: bool) -> Self {
        Self {
            blob,
            output_interval_ms,
            debug_artifacts,
        }
    }

    /// Builds and stores the bundle for one operation, returning its
    /// content hash.
    pub async fn build(
        &self,
        op: &OperationNode,
        job_id: &NodeId,
        nodes: &[GraphNode],
    ) -> Result<String> {
        let artifact_name = format!("{}_{}-execution-files", op.name, job_id.replace('/', "_"));
        let mut spec = ArtifactSpec::new(&artifact_name);

        self.add_inputs(&mut spec, op, nodes).await?;
        self.add_pointers(&mut spec, op, nodes);

        spec.add_file(
            "attributes.json",
            serde_json::to_vec_pretty(&op.attributes)
                .map_err(|err| ExecError::Host(format!("unserializable attributes: {err}")))?,
        );
        spec.add_file(
            "executor_config.json",
            serde_json::to_vec_pretty(&self.executor_config(op, nodes))
                .map_err(|err| ExecError::Host(format!("unserializable config: {err}")))?,
        );

        let hash = self.blob.save_artifact(spec).await?;
        info!("Saved execution files \"{}\" ({})", artifact_name, hash);
        Ok(hash)
    }

    /// Adds each input port's data hash under `inputs/<name>/<file>`.
    /// Ports without data are skipped; a hash the blob store cannot
    /// describe fails the operation with a configuration diagnostic.
    async fn add_inputs(
        &self,
        spec: &mut ArtifactSpec,
        op: &OperationNode,
        nodes: &[GraphNode],
    ) -> Result<()> {
        for port in model::ports_in(nodes, &op.id, types::INPUTS) {
            let Some(hash) = port.data else {
                warn!("Empty data hash for input \"{}\". Skipping it", port.name);
                continue;
            };

            let metadata = self
                .blob
                .get_metadata(&hash)
                .await
                .map_err(|_| ExecError::BlobRetrievalFailed {
                    input: port.name.clone(),
                })?;
            spec.add_object_hash(format!("inputs/{}/{}", port.name, metadata.name), hash);
        }
        Ok(())
    }

    /// Adds pointer-target data hashes under `pointers/<name>`.
    fn add_pointers(&self, spec: &mut ArtifactSpec, op: &OperationNode, nodes: &[GraphNode]) {
        for (ptr, target) in &op.pointers {
            if ptr == pointers::SRC || ptr == pointers::DST {
                continue;
            }
            let Some(target) = target else { continue };
            let Some(hash) = model::find_node(nodes, target)
                .and_then(|node| node.attribute_str(attrs::DATA))
            else {
                debug!("Pointer {} of {} has no stored data", ptr, op.name);
                continue;
            };
            spec.add_object_hash(format!("pointers/{ptr}"), hash.to_string());
        }
    }

    fn executor_config(&self, op: &OperationNode, nodes: &[GraphNode]) -> serde_json::Value {
        let mut result_artifacts: Vec<serde_json::Value> =
            model::ports_in(nodes, &op.id, types::OUTPUTS)
                .into_iter()
                .map(|port| {
                    json!({
                        "name": port.name,
                        "resultPatterns": [format!("outputs/{}", port.name)],
                    })
                })
                .collect();

        result_artifacts.push(json!({
            "name": STDOUT_ARTIFACT,
            "resultPatterns": ["job_stdout.txt"],
        }));

        if self.debug_artifacts {
            result_artifacts.push(json!({
                "name": format!("{}-all-files", op.name),
                "resultPatterns": [],
            }));
        }

        json!({
            "cmd": "forge-run",
            "args": ["attributes.json"],
            "outputInterval": self.output_interval_ms,
            "resultArtifacts": result_artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBlob;
    use std::collections::HashMap;

    fn node(id: &str, base_type: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            base_type: base_type.to_string(),
            attributes: HashMap::new(),
            pointers: HashMap::new(),
        }
    }

    fn fixture() -> (OperationNode, Vec<GraphNode>) {
        let mut op = node("/exec/a/op", "Operation");
        op.attributes.insert("name".to_string(), json!("train"));
        op.attributes.insert("epochs".to_string(), json!(10));

        let mut in_port = node("/exec/a/op/in/x", "Data");
        in_port.attributes.insert("name".to_string(), json!("x"));
        in_port
            .attributes
            .insert("data".to_string(), json!("hash-x"));

        let mut out_port = node("/exec/a/op/out/model", "Data");
        out_port
            .attributes
            .insert("name".to_string(), json!("model"));

        let nodes = vec![
            op.clone(),
            node("/exec/a/op/in", "Inputs"),
            in_port,
            node("/exec/a/op/out", "Outputs"),
            out_port,
        ];
        (model::operation_view(&nodes, &op), nodes)
    }

    #[tokio::test]
    async fn test_bundle_collects_inputs_and_config() {
        let blob = Arc::new(MemoryBlob::new());
        blob.insert("hash-x", "x.dat", "data");
        let builder = BundleBuilder::new(blob.clone(), 1500, false);
        let (op, nodes) = fixture();

        let hash = builder
            .build(&op, &"/exec/a".to_string(), &nodes)
            .await
            .unwrap();
        assert!(hash.starts_with("artifact-"));

        let saved = blob.saved_artifacts();
        assert_eq!(saved.len(), 1);
        let spec = &saved[0];
        assert_eq!(spec.name, "train_/exec/a-execution-files".replace('/', "_"));
        assert_eq!(
            spec.object_hashes.get("inputs/x/x.dat"),
            Some(&"hash-x".to_string())
        );
        assert!(spec.files.contains_key("attributes.json"));

        let config: serde_json::Value =
            serde_json::from_slice(&spec.files["executor_config.json"]).unwrap();
        let artifacts = config["resultArtifacts"].as_array().unwrap();
        assert!(artifacts.iter().any(|a| a["name"] == "model"));
        assert!(artifacts.iter().any(|a| a["name"] == "stdout"));
    }

    #[tokio::test]
    async fn test_missing_input_blob_fails_with_diagnostic() {
        let blob = Arc::new(MemoryBlob::new());
        let builder = BundleBuilder::new(blob, 1500, false);
        let (op, nodes) = fixture();

        let err = builder
            .build(&op, &"/exec/a".to_string(), &nodes)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::BlobRetrievalFailed { ref input } if input == "x"));
        assert!(err.to_string().contains("blob location"));
    }

    #[tokio::test]
    async fn test_inputs_without_data_are_skipped() {
        let blob = Arc::new(MemoryBlob::new());
        let builder = BundleBuilder::new(blob.clone(), 1500, false);
        let (op, mut nodes) = fixture();
        // Clear the input's data
        for node in nodes.iter_mut() {
            node.attributes.remove("data");
        }

        builder
            .build(&op, &"/exec/a".to_string(), &nodes)
            .await
            .unwrap();
        assert!(blob.saved_artifacts()[0].object_hashes.is_empty());
    }
}
