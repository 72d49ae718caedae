use std::{error::Error, fmt, io};

use crate::report::FailureReason;

/// The trainer's result type.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// All errors that can abort a trainer operation.
#[derive(Debug)]
pub enum TrainerError {
    /// Invalid configuration, caught before any network activity.
    Configuration(ConfigurationError),
    /// A worker couldn't be connected to.
    Connect(ConnectError),
    /// No worker contributed to a run.
    Aggregation(AggregationError),
    /// Some worker failed its part of a forward pass.
    Inference(InferenceError),
    /// A handle was used in a way its state doesn't allow.
    State(StateError),
    /// The input couldn't be encoded for the wire.
    Serialization(SerializationError),
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for TrainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "invalid configuration: {e}"),
            Self::Connect(e) => write!(f, "{e}"),
            Self::Aggregation(e) => write!(f, "{e}"),
            Self::Inference(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "invalid state: {e}"),
            Self::Serialization(e) => write!(f, "serialization failed: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Configuration(e) => Some(e),
            Self::Connect(e) => Some(e),
            Self::Aggregation(e) => Some(e),
            Self::Inference(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<ConfigurationError> for TrainerError {
    fn from(e: ConfigurationError) -> Self {
        Self::Configuration(e)
    }
}

impl From<ConnectError> for TrainerError {
    fn from(e: ConnectError) -> Self {
        Self::Connect(e)
    }
}

impl From<AggregationError> for TrainerError {
    fn from(e: AggregationError) -> Self {
        Self::Aggregation(e)
    }
}

impl From<InferenceError> for TrainerError {
    fn from(e: InferenceError) -> Self {
        Self::Inference(e)
    }
}

impl From<StateError> for TrainerError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<SerializationError> for TrainerError {
    fn from(e: SerializationError) -> Self {
        Self::Serialization(e)
    }
}

impl From<io::Error> for TrainerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<worker::WorkerErr> for TrainerError {
    fn from(e: worker::WorkerErr) -> Self {
        match e {
            worker::WorkerErr::UnknownModel { kind } => {
                Self::Configuration(ConfigurationError::UnknownModel(kind))
            }
            worker::WorkerErr::UnknownCriterion { kind } => {
                Self::Configuration(ConfigurationError::UnknownCriterion(kind))
            }
            worker::WorkerErr::SizeMismatch {
                what,
                got,
                expected,
            } => Self::Configuration(ConfigurationError::SizeMismatch {
                what,
                got,
                expected,
            }),
            other => Self::Io(other.into()),
        }
    }
}

/// Problems with the cluster configuration or the registered models.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    NoWorkers,
    DuplicateWorker(String),
    UnknownWorker(String),
    /// The in-process worker can't be removed.
    LocalWorker(String),
    DuplicateGpu { worker: String, gpu: u32 },
    InvalidPort { worker: String },
    ZeroMultiplier,
    BatchTooSmall { batch_size: usize, active: usize },
    UnknownModel(String),
    UnknownCriterion(String),
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkers => f.write_str("at least one worker is required"),
            Self::DuplicateWorker(name) => write!(f, "worker {name:?} is declared twice"),
            Self::UnknownWorker(name) => write!(f, "no worker named {name:?}"),
            Self::LocalWorker(name) => write!(f, "the local worker {name:?} can't be removed"),
            Self::DuplicateGpu { worker, gpu } => {
                write!(f, "worker {worker:?} lists gpu {gpu} more than once")
            }
            Self::InvalidPort { worker } => write!(f, "worker {worker:?} has port 0"),
            Self::ZeroMultiplier => f.write_str("batch_size_multiplier must be greater than 0"),
            Self::BatchTooSmall { batch_size, active } => write!(
                f,
                "batch of {batch_size} samples can't cover {active} active workers"
            ),
            Self::UnknownModel(kind) => write!(f, "no model registered as {kind:?}"),
            Self::UnknownCriterion(kind) => write!(f, "no criterion registered as {kind:?}"),
            Self::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
        }
    }
}

impl Error for ConfigurationError {}

/// Failures opening or probing a worker's channel.
#[derive(Debug)]
pub enum ConnectError {
    /// A TCP worker was declared without credentials.
    MissingCredentials { worker: String },
    /// The worker refused the credentials.
    Rejected { worker: String, reason: String },
    /// Every attempt to reach the worker failed.
    Unreachable {
        worker: String,
        attempts: u32,
        source: io::Error,
    },
    /// The worker answered something unexpected.
    Protocol { worker: String, detail: String },
    /// The channel was closed by the trainer.
    Closed { worker: String },
}

impl ConnectError {
    pub fn worker(&self) -> &str {
        match self {
            Self::MissingCredentials { worker }
            | Self::Rejected { worker, .. }
            | Self::Unreachable { worker, .. }
            | Self::Protocol { worker, .. }
            | Self::Closed { worker } => worker,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredentials { worker } => {
                write!(f, "worker {worker:?} has no credentials")
            }
            Self::Rejected { worker, reason } => {
                write!(f, "worker {worker:?} rejected the handshake: {reason}")
            }
            Self::Unreachable {
                worker,
                attempts,
                source,
            } => write!(
                f,
                "worker {worker:?} unreachable after {attempts} attempt(s): {source}"
            ),
            Self::Protocol { worker, detail } => {
                write!(f, "worker {worker:?} broke the protocol: {detail}")
            }
            Self::Closed { worker } => write!(f, "channel to {worker:?} is closed"),
        }
    }
}

impl Error for ConnectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unreachable { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Every worker of a run failed, so nothing was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationError {
    pub dropped: Vec<(String, FailureReason)>,
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no worker contributed to the run")?;

        for (i, (worker, reason)) in self.dropped.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{worker} ({reason})")?;
        }

        Ok(())
    }
}

impl Error for AggregationError {}

/// A forward pass is all or nothing, these workers failed theirs.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceError {
    pub dropped: Vec<(String, FailureReason)>,
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forward pass incomplete")?;

        for (i, (worker, reason)) in self.dropped.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{worker} ({reason})")?;
        }

        Ok(())
    }
}

impl Error for InferenceError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The handle's loss cache holds nothing.
    LossUnset,
    /// The handle was registered with another trainer.
    ForeignHandle,
    /// The model has no criterion to evaluate with.
    NoCriterion,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LossUnset => f.write_str("no loss has been cached yet"),
            Self::ForeignHandle => f.write_str("the handle belongs to another trainer"),
            Self::NoCriterion => f.write_str("no criterion registered for the model"),
        }
    }
}

impl Error for StateError {}

/// Input that can't be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    /// The samples aren't a whole number of rows.
    RaggedRows { len: usize, row: usize },
    /// A row with no inputs or no targets.
    EmptyRow { x_size: usize, y_size: usize },
    /// The parameters can't be indexed by the delta frame.
    IndexOverflow { len: usize },
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RaggedRows { len, row } => {
                write!(f, "{len} values aren't a whole number of {row} wide rows")
            }
            Self::EmptyRow { x_size, y_size } => {
                write!(f, "rows need inputs and targets, got {x_size} and {y_size}")
            }
            Self::IndexOverflow { len } => {
                write!(f, "{len} parameters can't be indexed with u32")
            }
        }
    }
}

impl Error for SerializationError {}
