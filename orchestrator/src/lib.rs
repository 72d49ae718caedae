pub mod aggregate;
pub mod config;
pub mod connection;
pub mod dataset;
pub mod error;
pub mod handle;
pub mod optimization;
pub mod partition;
pub mod report;
pub mod store;
pub mod stub;
mod trainer;

pub use config::{
    ClusterConfig, Credentials, DEFAULT_PORT, ResourceDescriptor, Transport, create_config,
};
pub use connection::{MemoryConnector, RetryPolicy, TcpConnector};
pub use dataset::Batch;
pub use error::{
    AggregationError, ConfigurationError, ConnectError, InferenceError, Result, SerializationError,
    StateError, TrainerError,
};
pub use handle::{CriterionHandle, ModelHandle};
pub use optimization::OptimizerSpec;
pub use report::{AggregatedResult, FailureReason, PartialResult, RunReport, Status};
pub use trainer::{Trainer, TrainerOptions};
