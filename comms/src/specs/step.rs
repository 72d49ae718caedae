use serde::{Deserialize, Serialize};

/// How the parameter data frame that follows a `Step` command must be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSpec {
    /// The worker's replica is already at the current version, no frame follows.
    None { version: u64 },
    /// A `Delta` frame follows, valid on top of version `from`, producing `to`.
    Incremental { from: u64, to: u64 },
    /// A `Params` frame follows with the complete parameters at version `to`.
    Full { to: u64 },
}

impl DeltaSpec {
    /// The replica version the worker holds once the delta is applied.
    pub fn target(&self) -> u64 {
        match *self {
            DeltaSpec::None { version } => version,
            DeltaSpec::Incremental { to, .. } | DeltaSpec::Full { to } => to,
        }
    }
}

/// One forward/backward request over a shard.
///
/// The model and criterion are referenced by registered identifiers that every
/// worker resolves on its own side, the computation itself never travels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub run_id: u64,
    pub model_id: String,
    pub model_kind: String,
    pub criterion_kind: String,
    pub x_size: usize,
    pub y_size: usize,
    pub samples: usize,
    pub delta: DeltaSpec,
}

/// An inference request over a shard of inputs, answered with outputs and no gradient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub run_id: u64,
    pub model_id: String,
    pub model_kind: String,
    pub x_size: usize,
    pub y_size: usize,
    pub samples: usize,
    pub delta: DeltaSpec,
}

/// Why a worker could not produce a result for its shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailure {
    /// The model or criterion failed while computing.
    Execution { detail: String },
    /// The worker's replica can't take the announced delta.
    StaleReplica { have: Option<u64>, want: u64 },
    /// The request itself was malformed.
    Protocol { detail: String },
}

/// Outcome of a step as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed(RemoteFailure),
}

/// The reply header to a `Step` or `Forward` command.
///
/// When `status` is `Ok` a `Gradient` frame follows a step and an `Outputs` frame
/// follows a forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub run_id: u64,
    pub loss: f64,
    pub sample_count: usize,
    pub status: StepStatus,
}
