//! Operation dependency graph
//!
//! Captures "operation A's completion makes operation B eligible"
//! relationships for one execution container. Built from the flat node
//! list: connections are the nodes carrying both `src` and `dst`
//! pointers; everything else (filtered to schedulable types) is an
//! operation. A port belongs to the operation whose subtree contains it,
//! resolved by sibling containment under the container.

use crate::error::{ExecError, Result};
use crate::host::GraphNode;
use crate::meta::pointers;
use forge_core::domain::{NodeId, PortId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// One data edge: a source port feeding a destination port of the
/// consuming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyLink {
    pub src_port: PortId,
    pub dst_port: PortId,
    pub consumer: NodeId,
}

/// Dependency structure of one execution container.
///
/// Owned by a single orchestrator; all mutation happens from its
/// completion loop. Ready sets are deterministic: ties are broken by
/// the insertion order of the node list the graph was built from.
#[derive(Debug)]
pub struct DependencyGraph {
    op_order: Vec<NodeId>,
    incoming_counts: HashMap<NodeId, usize>,
    links_from: HashMap<NodeId, Vec<DependencyLink>>,
    dispatched: HashSet<NodeId>,
    completed: HashSet<NodeId>,
    valid_connections: usize,
}

impl DependencyGraph {
    /// Builds the graph from the flat subtree of `container_id`.
    ///
    /// Connections whose ports cannot be resolved to operations are
    /// skipped with a warning so a partially-wired pipeline still runs
    /// its resolvable subset. A connection from an operation to itself
    /// is a construction error.
    pub fn build(
        container_id: &NodeId,
        nodes: &[GraphNode],
        schedulable_types: &[&str],
    ) -> Result<Self> {
        let connections: Vec<&GraphNode> = nodes
            .iter()
            .filter(|n| n.pointer(pointers::SRC).is_some() && n.pointer(pointers::DST).is_some())
            .collect();

        let mut op_order = Vec::new();
        let mut incoming_counts = HashMap::new();
        for node in nodes {
            let is_direct_child =
                sibling_containing(container_id, &node.id).as_ref() == Some(&node.id);
            if is_direct_child
                && schedulable_types.contains(&node.base_type.as_str())
                && node.pointer(pointers::SRC).is_none()
            {
                op_order.push(node.id.clone());
                incoming_counts.insert(node.id.clone(), 0);
            }
        }
        debug!("Found {} schedulable operations", op_order.len());

        let mut links_from: HashMap<NodeId, Vec<DependencyLink>> = HashMap::new();
        let mut valid_connections = 0;
        for conn in connections {
            let src_port = conn.pointer(pointers::SRC).expect("filtered above").clone();
            let dst_port = conn.pointer(pointers::DST).expect("filtered above").clone();

            let src_owner = sibling_containing(container_id, &src_port)
                .filter(|id| incoming_counts.contains_key(id));
            let dst_owner = sibling_containing(container_id, &dst_port)
                .filter(|id| incoming_counts.contains_key(id));

            let (Some(src_owner), Some(dst_owner)) = (src_owner, dst_owner) else {
                warn!(
                    "Skipping connection {} with unresolvable endpoint ({} -> {})",
                    conn.id, src_port, dst_port
                );
                continue;
            };

            if src_owner == dst_owner {
                return Err(ExecError::CyclicDependency(src_owner));
            }

            *incoming_counts.get_mut(&dst_owner).expect("owner resolved") += 1;
            valid_connections += 1;
            links_from.entry(src_owner).or_default().push(DependencyLink {
                src_port,
                dst_port,
                consumer: dst_owner,
            });
        }

        Ok(Self {
            op_order,
            incoming_counts,
            links_from,
            dispatched: HashSet::new(),
            completed: HashSet::new(),
            valid_connections,
        })
    }

    /// Operations whose inputs are all available and which have not been
    /// dispatched yet, in insertion order.
    pub fn ready_set(&self) -> Vec<NodeId> {
        self.op_order
            .iter()
            .filter(|id| {
                self.incoming_counts.get(*id) == Some(&0)
                    && !self.dispatched.contains(*id)
                    && !self.completed.contains(*id)
            })
            .cloned()
            .collect()
    }

    pub fn mark_dispatched(&mut self, op: &NodeId) {
        self.dispatched.insert(op.clone());
    }

    /// Records a completed operation and returns the operations that
    /// just became ready, in insertion order.
    ///
    /// Safe against double invocation: a second completion of the same
    /// operation is a no-op, so downstream counts never go below zero.
    pub fn on_operation_complete(&mut self, op: &NodeId) -> Vec<NodeId> {
        if !self.incoming_counts.contains_key(op) {
            warn!("Completion reported for unknown operation {}", op);
            return Vec::new();
        }
        if !self.completed.insert(op.clone()) {
            warn!("Duplicate completion reported for {}", op);
            return Vec::new();
        }

        let mut newly_ready = HashSet::new();
        if let Some(links) = self.links_from.get(op) {
            for link in links {
                let Some(count) = self.incoming_counts.get_mut(&link.consumer) else {
                    continue;
                };
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        newly_ready.insert(link.consumer.clone());
                    }
                }
            }
        }

        self.op_order
            .iter()
            .filter(|id| newly_ready.contains(*id) && !self.dispatched.contains(*id))
            .cloned()
            .collect()
    }

    /// Data-forwarding edges out of an operation.
    pub fn downstream_links(&self, op: &NodeId) -> &[DependencyLink] {
        self.links_from.get(op).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_count(&self) -> usize {
        self.op_order.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.op_order.len()
    }

    pub fn incoming_count(&self, op: &NodeId) -> Option<usize> {
        self.incoming_counts.get(op).copied()
    }

    /// Number of connections that survived endpoint resolution.
    pub fn connection_count(&self) -> usize {
        self.valid_connections
    }
}

/// Resolves a node to the direct child of `container` whose subtree
/// contains it: the first path segment below the container.
fn sibling_containing(container: &NodeId, node_id: &NodeId) -> Option<NodeId> {
    let prefix = format!("{container}/");
    let rel = node_id.strip_prefix(prefix.as_str())?;
    let first = rel.split('/').next()?;
    if first.is_empty() {
        return None;
    }
    Some(format!("{container}/{first}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const EXEC: &str = "/exec";

    fn node(id: &str, base_type: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            base_type: base_type.to_string(),
            attributes: HashMap::new(),
            pointers: HashMap::new(),
        }
    }

    fn connection(id: &str, src: &str, dst: &str) -> GraphNode {
        let mut conn = node(id, "Connection");
        conn.pointers
            .insert("src".to_string(), Some(src.to_string()));
        conn.pointers
            .insert("dst".to_string(), Some(dst.to_string()));
        conn
    }

    /// Two jobs a -> b plus an independent job c.
    fn linear_fixture() -> Vec<GraphNode> {
        vec![
            node("/exec/a", "Job"),
            node("/exec/a/op/outputs/out", "Data"),
            node("/exec/b", "Job"),
            node("/exec/b/op/inputs/in", "Data"),
            node("/exec/c", "Job"),
            connection("/exec/conn1", "/exec/a/op/outputs/out", "/exec/b/op/inputs/in"),
        ]
    }

    fn build(nodes: &[GraphNode]) -> DependencyGraph {
        DependencyGraph::build(&EXEC.to_string(), nodes, &["Job"]).unwrap()
    }

    #[test]
    fn test_initial_ready_set_has_zero_incoming_ops() {
        let graph = build(&linear_fixture());
        assert_eq!(graph.ready_set(), vec!["/exec/a", "/exec/c"]);
        assert_eq!(graph.total_count(), 3);
    }

    #[test]
    fn test_incoming_counts_sum_to_connection_count() {
        let graph = build(&linear_fixture());
        let sum: usize = ["/exec/a", "/exec/b", "/exec/c"]
            .iter()
            .map(|op| graph.incoming_count(&op.to_string()).unwrap())
            .sum();
        assert_eq!(sum, graph.connection_count());
        assert_eq!(sum, 1);
    }

    #[test]
    fn test_completion_unlocks_downstream_op() {
        let mut graph = build(&linear_fixture());
        let newly_ready = graph.on_operation_complete(&"/exec/a".to_string());
        assert_eq!(newly_ready, vec!["/exec/b"]);
        assert_eq!(graph.incoming_count(&"/exec/b".to_string()), Some(0));

        let links = graph.downstream_links(&"/exec/a".to_string());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].src_port, "/exec/a/op/outputs/out");
        assert_eq!(links[0].dst_port, "/exec/b/op/inputs/in");
    }

    #[test]
    fn test_double_completion_does_not_double_decrement() {
        let mut graph = build(&linear_fixture());
        graph.on_operation_complete(&"/exec/a".to_string());
        let again = graph.on_operation_complete(&"/exec/a".to_string());

        assert!(again.is_empty());
        assert_eq!(graph.incoming_count(&"/exec/b".to_string()), Some(0));
        assert_eq!(graph.completed_count(), 1);
    }

    #[test]
    fn test_self_loop_is_rejected() {
        let nodes = vec![
            node("/exec/a", "Job"),
            node("/exec/a/op/outputs/out", "Data"),
            node("/exec/a/op/inputs/in", "Data"),
            connection("/exec/conn1", "/exec/a/op/outputs/out", "/exec/a/op/inputs/in"),
        ];
        let err = DependencyGraph::build(&EXEC.to_string(), &nodes, &["Job"]).unwrap_err();
        assert!(matches!(err, ExecError::CyclicDependency(_)));
    }

    #[test]
    fn test_malformed_connection_is_skipped() {
        let mut nodes = linear_fixture();
        // dst resolves to a node that is not a schedulable operation
        nodes.push(connection(
            "/exec/conn2",
            "/exec/a/op/outputs/out",
            "/ghost/op/inputs/in",
        ));

        let graph = build(&nodes);
        assert_eq!(graph.connection_count(), 1);
        assert_eq!(graph.ready_set(), vec!["/exec/a", "/exec/c"]);
    }

    #[test]
    fn test_dispatched_ops_leave_the_ready_set() {
        let mut graph = build(&linear_fixture());
        graph.mark_dispatched(&"/exec/a".to_string());
        assert_eq!(graph.ready_set(), vec!["/exec/c"]);
    }

    #[test]
    fn test_run_to_completion() {
        let mut graph = build(&linear_fixture());
        for op in ["/exec/a", "/exec/c", "/exec/b"] {
            graph.on_operation_complete(&op.to_string());
        }
        assert!(graph.is_complete());
    }
}
