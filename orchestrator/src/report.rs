use std::fmt;

/// Why a worker did not contribute to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The round-trip didn't finish in time.
    Timeout,
    /// The channel to the worker couldn't be opened.
    Connect(String),
    /// The link broke and retrying didn't help.
    Transport(String),
    /// The worker failed computing its shard.
    Remote(String),
    /// The worker's replica couldn't take the parameter delta.
    StaleReplica { have: Option<u64>, want: u64 },
    /// The worker replied something that doesn't follow the protocol.
    Protocol(String),
    /// The result arrived but failed validation.
    Corrupt(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Transport(e) => write!(f, "transport failed: {e}"),
            Self::Remote(e) => write!(f, "remote error: {e}"),
            Self::StaleReplica {
                have: Some(have),
                want,
            } => write!(f, "stale replica at version {have}, wanted {want}"),
            Self::StaleReplica { have: None, want } => {
                write!(f, "missing replica, wanted version {want}")
            }
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt result: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Ok,
    Failed(FailureReason),
}

/// One worker's outcome for its shard.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub owner: String,
    pub loss: f64,
    pub grad_update: Vec<f32>,
    pub sample_count: usize,
    pub status: Status,
}

impl PartialResult {
    pub fn ok(owner: impl Into<String>, loss: f64, grad_update: Vec<f32>, sample_count: usize) -> Self {
        Self {
            owner: owner.into(),
            loss,
            grad_update,
            sample_count,
            status: Status::Ok,
        }
    }

    pub fn failed(owner: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            owner: owner.into(),
            loss: 0.0,
            grad_update: Vec::new(),
            sample_count: 0,
            status: Status::Failed(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// The combined loss of a run, as cached by the handles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedResult {
    /// Sample weighted mean of the contributors' losses.
    pub loss: f64,
    /// Amount of samples that contributed.
    pub sample_count: usize,
    /// Whether the gradient was applied to the parameters.
    pub applied: bool,
}

/// What `Trainer::run` hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub result: AggregatedResult,
    /// Workers whose results were combined, in configuration order.
    pub contributors: Vec<String>,
    /// Workers left out of the run, in configuration order.
    pub dropped: Vec<(String, FailureReason)>,
    /// The parameter version the run produced.
    pub version: u64,
}

impl RunReport {
    /// A degraded run completed without some of its workers.
    pub fn is_degraded(&self) -> bool {
        !self.dropped.is_empty()
    }
}
