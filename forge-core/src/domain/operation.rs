//! Operation, port and connection types
//!
//! These are flat views over the host graph: an operation owns ordered
//! input/output ports, and connections wire an output port of one
//! operation to an input port of another.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Identifier of a node in the host graph (a path-like string).
pub type NodeId = String;

/// Identifier of a port node. Ports are graph nodes too.
pub type PortId = String;

/// A schedulable operation parsed from a pipeline/execution container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationNode {
    pub id: NodeId,
    pub name: String,
    /// Name of the meta type this operation is an instance of.
    pub base_type: String,
    pub attributes: HashMap<String, JsonValue>,
    /// Pointer name to target id. `None` marks a cleared pointer.
    pub pointers: HashMap<String, Option<NodeId>>,
    /// Input ports in declaration order.
    pub input_ports: Vec<PortId>,
    /// Output ports in declaration order.
    pub output_ports: Vec<PortId>,
}

impl OperationNode {
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// A data port owned by an operation.
///
/// Output ports receive `data` when their operation completes; input
/// ports receive `data` forwarded from a connected output port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub name: String,
    pub operation_id: NodeId,
    /// Content-addressed hash of the serialized value, once produced.
    pub data: Option<String>,
    /// Type tag of the produced value.
    #[serde(rename = "type")]
    pub type_name: Option<String>,
}

/// An edge in the dependency graph. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: NodeId,
    pub src: PortId,
    pub dst: PortId,
}
