//! Error taxonomy for the execution orchestrator

use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors raised while orchestrating a pipeline execution.
///
/// Graph-construction and save-buffer errors are fatal for the whole
/// run; the remaining variants fail a single job and leave siblings
/// running wherever their inputs allow it.
#[derive(Debug, Error)]
pub enum ExecError {
    /// An operation consumes its own output
    #[error("operation {0} depends on itself")]
    CyclicDependency(String),

    /// The dependency graph could not be built
    #[error("invalid pipeline graph: {0}")]
    GraphConstruction(String),

    /// A node creation referenced an unrecognized meta type
    #[error("cannot create node with unrecognized type: {0}")]
    UnknownType(String),

    /// Buffered node creations form a parent cycle
    #[error("cannot order node creations, unresolvable ids: {0}")]
    UnresolvableCreationOrder(String),

    /// The executor rejected a job submission or was unreachable
    #[error("failed to submit job {job}: {reason}")]
    RemoteSubmission { job: String, reason: String },

    /// An input artifact could not be fetched from blob storage
    #[error(
        "failed to retrieve \"{input}\" from blob storage; \
         check that the blob location is configured correctly \
         and that the project was created with the same blob store"
    )]
    BlobRetrievalFailed { input: String },

    /// The executor reported a status outside the known set
    #[error("unexpected executor status: {0}")]
    UnexpectedExecutorStatus(String),

    /// A job recorded as running has no remote handle to resume
    #[error("cannot resume job {0}: missing job handle")]
    MissingJobHandle(String),

    /// A service client call failed
    #[error(transparent)]
    Client(#[from] forge_client::ClientError),

    /// The host graph/blob backend failed
    #[error("host backend error: {0}")]
    Host(String),
}
