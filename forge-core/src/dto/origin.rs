//! Job origin wire types

use serde::{Deserialize, Serialize};

/// Provenance record for a submitted job: which node, job and execution
/// it belongs to and the branch it was started from.
///
/// Recorded at submission time and consulted on restart to decide
/// whether an in-flight job may be resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOrigin {
    /// Remote job hash.
    pub hash: String,
    /// Id of the job node in the host graph.
    pub node_id: String,
    /// Name of the job.
    pub job: String,
    /// Name of the owning execution.
    pub execution: String,
    /// Branch the job was started from.
    pub branch: String,
}
