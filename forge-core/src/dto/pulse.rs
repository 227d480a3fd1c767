//! Heartbeat (pulse) wire types

use serde::{Deserialize, Serialize};

/// Liveness of a run id as reported by the pulse service.
///
/// The service is TTL-based: a run that stopped updating decays from
/// `Alive` to `Dead`; a run id it has never seen is `DoesntExist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pulse {
    Alive,
    Dead,
    DoesntExist,
}

impl Pulse {
    pub fn is_alive(&self) -> bool {
        matches!(self, Pulse::Alive)
    }
}
