//! Run liveness heartbeat
//!
//! While an orchestrator owns a run it refreshes a pulse entry keyed by
//! the run id. Another orchestrator finding the entry alive knows not
//! to resume the run's jobs. The update cadence compensates for the
//! time each update takes so beats stay evenly spaced.

use crate::host::PulseService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error};

/// Background heartbeat task for one run id.
///
/// Started on the first job dispatch and stopped exactly once at
/// finalization; `stop` is idempotent and dropping the handle stops the
/// task as well.
pub struct Heartbeat {
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawns the heartbeat loop.
    pub fn start(pulse: Arc<dyn PulseService>, run_id: String, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            debug!("Starting heartbeat for run {}", run_id);
            loop {
                let started = Instant::now();
                if let Err(err) = pulse.update(&run_id).await {
                    error!("Heartbeat update failed for {}: {}", run_id, err);
                }
                sleep(interval.saturating_sub(started.elapsed())).await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Stops the heartbeat. Returns whether this call stopped it.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
