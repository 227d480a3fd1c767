//! Meta vocabulary of the execution model
//!
//! Names of the meta types and attributes the orchestrator reads and
//! writes on the host graph. The host project defines the actual meta
//! model; these are the parts the orchestrator depends on.

/// Meta type names.
pub mod types {
    pub const PIPELINE: &str = "Pipeline";
    pub const EXECUTION: &str = "Execution";
    pub const JOB: &str = "Job";
    pub const OPERATION: &str = "Operation";
    pub const INPUTS: &str = "Inputs";
    pub const OUTPUTS: &str = "Outputs";
    pub const DATA: &str = "Data";
    pub const CONNECTION: &str = "Connection";
    pub const METADATA: &str = "Metadata";

    /// Local operation primitives, executed in-process.
    pub const ARTIFACT_INPUT: &str = "Input";
    pub const ARTIFACT_OUTPUT: &str = "Output";
    pub const ARTIFACT_FINDER: &str = "ArtifactFinder";
}

/// Attribute names.
pub mod attrs {
    pub const NAME: &str = "name";
    pub const STATUS: &str = "status";
    pub const STDOUT: &str = "stdout";
    pub const DATA: &str = "data";
    pub const TYPE: &str = "type";
    pub const JOB_INFO: &str = "jobInfo";
    pub const EXEC_FILES: &str = "execFiles";
    pub const CREATED_AT: &str = "createdAt";
    pub const ARTIFACT_NAME: &str = "artifactName";
    pub const SAVE_NAME: &str = "saveName";
    /// Sequence number of the metadata command that produced a node.
    pub const COMMAND_ID: &str = "id";
}

/// Pointer names.
pub mod pointers {
    pub const SRC: &str = "src";
    pub const DST: &str = "dst";
    /// Execution to originating pipeline.
    pub const ORIGIN: &str = "origin";
}
