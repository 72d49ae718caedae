//! Wire-level contracts exchanged between the orchestrator and its workers.
//!
//! Models and losses are named by their registry kind, never referenced directly.

pub mod auth;
pub mod step;
