//! Execution snapshots
//!
//! An execution is a copy of a pipeline frozen at launch time: every
//! operation is wrapped in a job carrying run state, ports are copied
//! and connections re-pointed into the copies. The whole snapshot goes
//! through the save buffer so it commits as one atomic change.

use crate::error::Result;
use crate::host::{GraphNode, GraphStore};
use crate::meta::{attrs, pointers, types};
use crate::service::model;
use crate::store::SaveBuffer;
use forge_core::domain::NodeId;
use forge_core::domain::execution::{Execution, ExecutionStatus};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Creates executions from pipeline templates.
pub struct ExecutionBuilder {
    graph: Arc<dyn GraphStore>,
    buffer: Arc<SaveBuffer>,
}

impl ExecutionBuilder {
    pub fn new(graph: Arc<dyn GraphStore>, buffer: Arc<SaveBuffer>) -> Self {
        Self { graph, buffer }
    }

    /// Snapshots `pipeline_id` into a new execution under
    /// `target_container`, returning the committed execution.
    pub async fn create_execution(
        &self,
        pipeline_id: &NodeId,
        target_container: &NodeId,
    ) -> Result<Execution> {
        let nodes = self.graph.load_subtree(pipeline_id).await?;
        let pipeline = model::find_node(&nodes, pipeline_id)
            .cloned()
            .unwrap_or_else(|| GraphNode {
                id: pipeline_id.clone(),
                base_type: types::PIPELINE.to_string(),
                attributes: HashMap::new(),
                pointers: HashMap::new(),
            });
        let pipeline_name = model::name_of(&pipeline);

        let exec_name = self
            .unique_execution_name(&pipeline_name, target_container)
            .await?;
        info!("Creating execution \"{}\" of {}", exec_name, pipeline_name);

        let created_at = chrono::Utc::now();
        let exec = self.buffer.create_node(types::EXECUTION, target_container)?;
        self.buffer.set_attribute(&exec, attrs::NAME, json!(exec_name));
        self.buffer.set_attribute(
            &exec,
            attrs::CREATED_AT,
            json!(created_at.timestamp_millis()),
        );
        self.buffer
            .set_pointer(&exec, pointers::ORIGIN, Some(pipeline_id.clone()));

        let (port_map, job_temps) = self.copy_operations(&nodes, pipeline_id, &exec)?;
        self.copy_connections(&nodes, &exec, &port_map)?;

        let outcome = self
            .buffer
            .commit(&format!("Created execution of {pipeline_name}"))
            .await?;
        let resolve = |id: NodeId| outcome.resolved.get(&id).cloned().unwrap_or(id);

        Ok(Execution {
            id: resolve(exec),
            name: exec_name,
            status: ExecutionStatus::Running,
            pipeline_id: Some(pipeline_id.clone()),
            created_at,
            job_ids: job_temps.into_iter().map(resolve).collect(),
        })
    }

    /// Wraps each pipeline operation in a job; returns the old-port to
    /// new-port mapping for connection re-pointing plus the created job
    /// ids.
    fn copy_operations(
        &self,
        nodes: &[GraphNode],
        pipeline_id: &NodeId,
        exec: &NodeId,
    ) -> Result<(HashMap<NodeId, NodeId>, Vec<NodeId>)> {
        let mut port_map = HashMap::new();
        let mut job_temps = Vec::new();

        for op in model::direct_children(nodes, pipeline_id) {
            if op.pointer(pointers::SRC).is_some() && op.pointer(pointers::DST).is_some() {
                continue; // connection, copied separately
            }

            let job = self.buffer.create_node(types::JOB, exec)?;
            job_temps.push(job.clone());
            self.buffer
                .set_attribute(&job, attrs::NAME, json!(model::name_of(op)));
            self.buffer
                .set_attribute(&job, attrs::STATUS, json!("pending"));

            let new_op = self.buffer.create_node(&op.base_type, &job)?;
            for (name, value) in &op.attributes {
                self.buffer.set_attribute(&new_op, name, value.clone());
            }
            for (name, target) in &op.pointers {
                self.buffer.set_pointer(&new_op, name, target.clone());
            }

            for container_type in [types::INPUTS, types::OUTPUTS] {
                let container = self.buffer.create_node(container_type, &new_op)?;
                for port in model::ports_in(nodes, &op.id, container_type) {
                    let new_port = self.buffer.create_node(types::DATA, &container)?;
                    self.buffer
                        .set_attribute(&new_port, attrs::NAME, json!(port.name));
                    if let Some(type_name) = &port.type_name {
                        self.buffer
                            .set_attribute(&new_port, attrs::TYPE, json!(type_name));
                    }
                    if let Some(data) = &port.data {
                        self.buffer
                            .set_attribute(&new_port, attrs::DATA, json!(data));
                    }
                    port_map.insert(port.id, new_port);
                }
            }
        }

        Ok((port_map, job_temps))
    }

    fn copy_connections(
        &self,
        nodes: &[GraphNode],
        exec: &NodeId,
        port_map: &HashMap<NodeId, NodeId>,
    ) -> Result<()> {
        for conn in nodes {
            let (Some(src), Some(dst)) = (conn.pointer(pointers::SRC), conn.pointer(pointers::DST))
            else {
                continue;
            };

            let (Some(new_src), Some(new_dst)) = (port_map.get(src), port_map.get(dst)) else {
                warn!("Skipping connection {} with unknown endpoints", conn.id);
                continue;
            };

            let new_conn = self.buffer.create_node(types::CONNECTION, exec)?;
            self.buffer
                .set_pointer(&new_conn, pointers::SRC, Some(new_src.clone()));
            self.buffer
                .set_pointer(&new_conn, pointers::DST, Some(new_dst.clone()));
        }
        Ok(())
    }

    /// `<pipeline>_execution`, numbered when taken by a sibling.
    async fn unique_execution_name(
        &self,
        pipeline_name: &str,
        target_container: &NodeId,
    ) -> Result<String> {
        let siblings = self.graph.load_subtree(target_container).await?;
        let taken: HashSet<String> = model::direct_children(&siblings, target_container)
            .into_iter()
            .filter(|n| n.base_type == types::EXECUTION)
            .map(model::name_of)
            .collect();

        let base = format!("{pipeline_name}_execution");
        if !taken.contains(&base) {
            return Ok(base);
        }
        let mut suffix = 2;
        loop {
            let name = format!("{base}_{suffix}");
            if !taken.contains(&name) {
                return Ok(name);
            }
            suffix += 1;
        }
    }
}
