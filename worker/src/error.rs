use std::{error::Error, fmt, io};

use comms::specs::step::RemoteFailure;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    UnknownModel {
        kind: String,
    },
    UnknownCriterion {
        kind: String,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    StaleReplica {
        model_id: String,
        have: Option<u64>,
        want: u64,
    },
    NonFinite {
        what: &'static str,
    },
}

impl WorkerErr {
    /// Maps this error into the failure reported back to the orchestrator.
    pub fn into_failure(self) -> RemoteFailure {
        match self {
            WorkerErr::StaleReplica { have, want, .. } => RemoteFailure::StaleReplica { have, want },
            e @ (WorkerErr::Io(_) | WorkerErr::UnexpectedMessage { .. }) => {
                RemoteFailure::Protocol {
                    detail: e.to_string(),
                }
            }
            e => RemoteFailure::Execution {
                detail: e.to_string(),
            },
        }
    }
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
            WorkerErr::UnknownModel { kind } => write!(f, "no model registered as {kind:?}"),
            WorkerErr::UnknownCriterion { kind } => {
                write!(f, "no criterion registered as {kind:?}")
            }
            WorkerErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            WorkerErr::StaleReplica {
                model_id,
                have,
                want,
            } => match have {
                Some(have) => write!(
                    f,
                    "replica of {model_id} is at version {have}, can't move to {want}"
                ),
                None => write!(f, "no replica of {model_id}, can't move to {want}"),
            },
            WorkerErr::NonFinite { what } => write!(f, "{what} is not finite"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
