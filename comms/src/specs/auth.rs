use serde::{Deserialize, Serialize};

/// Credential material presented by the orchestrator when opening a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSpec {
    /// The name the orchestrator knows the worker by.
    pub worker: String,
    pub username: String,
    pub token: String,
}
