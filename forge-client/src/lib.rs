//! Forge Service Clients
//!
//! Type-safe HTTP clients for the external services the orchestrator
//! consumes: the remote executor, the pulse (heartbeat) service, the
//! job-origin registry and the job-log store.
//!
//! Each client is a thin wrapper over a shared `reqwest` connection
//! pool. They only encode the wire contracts; all orchestration policy
//! lives in `forge-exec`.
//!
//! # Example
//!
//! ```no_run
//! use forge_client::ExecutorClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), forge_client::ClientError> {
//!     let executor = ExecutorClient::new("http://localhost:8080");
//!
//!     let job = executor.create_job("bundle-hash").await?;
//!     println!("Submitted job: {}", job.hash);
//!     Ok(())
//! }
//! ```

pub mod error;
mod executor;
mod http;
mod logs;
mod origin;
mod pulse;

pub use error::{ClientError, Result};
pub use executor::ExecutorClient;
pub use logs::LogsClient;
pub use origin::OriginClient;
pub use pulse::PulseClient;
