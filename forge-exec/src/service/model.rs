//! Helpers for walking a flat execution subtree

use crate::host::GraphNode;
use crate::meta::{attrs, pointers, types};
use forge_core::domain::{Connection, NodeId, OperationNode, Port};

/// Direct children of `parent` within the flat node list.
pub fn direct_children<'a>(nodes: &'a [GraphNode], parent: &NodeId) -> Vec<&'a GraphNode> {
    let prefix = format!("{parent}/");
    nodes
        .iter()
        .filter(|n| {
            n.id.strip_prefix(prefix.as_str())
                .is_some_and(|rel| !rel.is_empty() && !rel.contains('/'))
        })
        .collect()
}

pub fn find_node<'a>(nodes: &'a [GraphNode], id: &NodeId) -> Option<&'a GraphNode> {
    nodes.iter().find(|n| &n.id == id)
}

/// The connections in a flat node list: nodes carrying both `src` and
/// `dst` pointers.
pub fn connections(nodes: &[GraphNode]) -> Vec<Connection> {
    nodes
        .iter()
        .filter_map(|n| {
            let src = n.pointer(pointers::SRC)?.clone();
            let dst = n.pointer(pointers::DST)?.clone();
            Some(Connection {
                id: n.id.clone(),
                src,
                dst,
            })
        })
        .collect()
}

/// The operation wrapped by a job: its direct child that is an
/// operation type (including the local operation primitives).
pub fn operation_of_job<'a>(nodes: &'a [GraphNode], job_id: &NodeId) -> Option<&'a GraphNode> {
    direct_children(nodes, job_id).into_iter().find(|n| {
        n.base_type == types::OPERATION
            || crate::service::local::LocalOperation::from_base_type(&n.base_type).is_some()
    })
}

/// An operation's ports inside the given container type (`Inputs` or
/// `Outputs`), in declaration order.
pub fn ports_in(nodes: &[GraphNode], op_id: &NodeId, container_type: &str) -> Vec<Port> {
    let Some(container) = direct_children(nodes, op_id)
        .into_iter()
        .find(|n| n.base_type == container_type)
    else {
        return Vec::new();
    };

    direct_children(nodes, &container.id)
        .into_iter()
        .map(|port| Port {
            id: port.id.clone(),
            name: port
                .attribute_str(attrs::NAME)
                .unwrap_or(port.id.as_str())
                .to_string(),
            operation_id: op_id.clone(),
            data: port.attribute_str(attrs::DATA).map(str::to_string),
            type_name: port.attribute_str(attrs::TYPE).map(str::to_string),
        })
        .collect()
}

/// The typed view of an operation: attributes, pointers and port ids
/// pulled out of the flat subtree.
pub fn operation_view(nodes: &[GraphNode], node: &GraphNode) -> OperationNode {
    OperationNode {
        id: node.id.clone(),
        name: name_of(node),
        base_type: node.base_type.clone(),
        attributes: node.attributes.clone(),
        pointers: node.pointers.clone(),
        input_ports: ports_in(nodes, &node.id, types::INPUTS)
            .into_iter()
            .map(|port| port.id)
            .collect(),
        output_ports: ports_in(nodes, &node.id, types::OUTPUTS)
            .into_iter()
            .map(|port| port.id)
            .collect(),
    }
}

/// Display name of a node, falling back to its id.
pub fn name_of(node: &GraphNode) -> String {
    node.attribute_str(attrs::NAME)
        .unwrap_or(node.id.as_str())
        .to_string()
}
