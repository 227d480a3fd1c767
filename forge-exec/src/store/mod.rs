//! Deferred-write layer over the versioned graph store
//!
//! Calling code mutates the model as if changes were immediate; the
//! buffer records them and replays everything in one atomic commit,
//! resolving references to not-yet-created nodes along the way.

pub mod buffer;

pub use buffer::{CommitOutcome, NodeCache, SaveBuffer, SharedNodeMap, is_create_id};
