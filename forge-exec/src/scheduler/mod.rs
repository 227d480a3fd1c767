//! Scheduling layer for the orchestrator
//!
//! Builds the operation dependency graph, watches submitted jobs
//! through the executor's lifecycle, keeps the run's liveness heartbeat
//! and decides between resuming and restarting on orchestrator start.

pub mod dependency;
pub mod heartbeat;
pub mod resume;
pub mod watcher;

pub use dependency::{DependencyGraph, DependencyLink};
pub use heartbeat::Heartbeat;
pub use resume::{ResumeDecider, ResumeDecision};
pub use watcher::{JobWatcher, WatchedJob};
