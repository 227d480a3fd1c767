//! Resume-or-restart decision
//!
//! On orchestrator start, a job whose stored status is `running` may be
//! left over from a disconnected session. It is resumed only when its
//! recorded origin branch matches the current branch and the liveness
//! heartbeat shows no other process owns it; anything else re-executes
//! from scratch.

use crate::error::{ExecError, Result};
use crate::host::{OriginService, PulseService};
use forge_core::domain::{Job, JobStatus};
use forge_core::dto::pulse::Pulse;
use std::sync::Arc;
use tracing::{debug, info};

/// Whether a previously-created job should be re-run or picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Re-execute from scratch.
    Fresh,
    /// Re-attach to the in-flight remote job.
    Resume,
}

/// Pure decision core.
///
/// Resume requires: stored status `running`, a recorded origin on the
/// current branch, and a heartbeat that is not alive. A live heartbeat
/// means another process owns the job; resuming against it would
/// double-run the operation.
pub fn decide(
    status: JobStatus,
    origin_branch: Option<&str>,
    current_branch: &str,
    pulse: Pulse,
) -> ResumeDecision {
    if status != JobStatus::Running {
        return ResumeDecision::Fresh;
    }

    match origin_branch {
        Some(branch) if branch == current_branch => {
            if pulse.is_alive() {
                ResumeDecision::Fresh
            } else {
                ResumeDecision::Resume
            }
        }
        // Stale or forked provenance; never resume across branches
        _ => ResumeDecision::Fresh,
    }
}

/// Queries origin and pulse services to apply [`decide`] to a job.
pub struct ResumeDecider {
    origin: Arc<dyn OriginService>,
    pulse: Arc<dyn PulseService>,
}

impl ResumeDecider {
    pub fn new(origin: Arc<dyn OriginService>, pulse: Arc<dyn PulseService>) -> Self {
        Self { origin, pulse }
    }

    /// Decides whether `job` should be resumed on `current_branch`.
    ///
    /// A job recorded as running without a remote handle cannot be
    /// checked, let alone resumed; that is a configuration error.
    pub async fn should_resume(&self, job: &Job, current_branch: &str) -> Result<ResumeDecision> {
        if job.status != JobStatus::Running {
            return Ok(ResumeDecision::Fresh);
        }

        let Some(job_info) = &job.job_info else {
            return Err(ExecError::MissingJobHandle(job.name.clone()));
        };

        let origin = self.origin.get_origin(&job_info.hash).await?;
        let origin_branch = origin.as_ref().map(|o| o.branch.as_str());

        let decision = match origin_branch {
            Some(branch) if branch == current_branch => {
                let pulse = self.pulse.check(&job_info.hash).await?;
                debug!("Pulse for {} is {:?}", job_info.hash, pulse);
                decide(job.status, origin_branch, current_branch, pulse)
            }
            _ => ResumeDecision::Fresh,
        };

        info!(
            "Job {} ({}) on branch {}: {:?}",
            job.name, job.id, current_branch, decision
        );
        Ok(decision)
    }
}
