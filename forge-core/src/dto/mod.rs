//! DTOs for the external services the orchestrator consumes
//!
//! These mirror the wire contracts of the remote executor, the pulse
//! (heartbeat) service and the job-origin registry. The services
//! themselves are out of scope; only these shapes matter here.

pub mod executor;
pub mod origin;
pub mod pulse;

pub use executor::{ExecutorInfo, ExecutorJobInfo, ExecutorStatus, OutputLine};
pub use origin::JobOrigin;
pub use pulse::Pulse;
