pub mod acceptor;
pub mod error;
pub mod executor;
pub mod model;
pub mod registry;
pub mod service;

pub use acceptor::WorkerAcceptor;
pub use error::{Result, WorkerErr};
pub use executor::{Delta, Executor, Outcome};
pub use model::{Criterion, Linear, Model, Mse, Shape};
pub use registry::Registry;
pub use service::Service;
