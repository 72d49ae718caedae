//! The orchestrator side of a step or forward pass: encoding the request for a
//! worker and turning its reply into a `PartialResult` or outputs.

use std::{io, sync::Arc, time::Duration};

use comms::{
    msg::{Command, Msg, Payload},
    specs::step::{ForwardSpec, RemoteFailure, StepReport, StepSpec, StepStatus},
};
use tokio::{task, time};
use worker::{Criterion, Model, Shape, WorkerErr};

use crate::{
    connection::Link,
    dataset::Shard,
    error::SerializationError,
    report::{FailureReason, PartialResult},
    store::{ParamDelta, ParameterStore},
};

/// What a worker is asked to do with a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task<'a> {
    /// Loss and gradient under the criterion of the given kind. Shards carry
    /// whole rows.
    Train { criterion_kind: &'a str },
    /// Outputs only. Shards carry inputs without targets.
    Infer,
}

/// Everything a worker needs to run one shard of a run.
pub struct StepRequest<'a> {
    pub run_id: u64,
    /// The id replicas of the model are stored under.
    pub model_id: &'a str,
    pub model_kind: &'a str,
    pub task: Task<'a>,
    pub shape: Shape,
    pub store: &'a ParameterStore,
    pub shard: &'a Shard,
}

impl StepRequest<'_> {
    /// Rejects requests that can't be put on the wire.
    pub fn validate(&self) -> Result<(), SerializationError> {
        let Shape { x_size, y_size } = self.shape;

        if self.shape.is_empty() {
            return Err(SerializationError::EmptyRow { x_size, y_size });
        }

        let row = match self.task {
            Task::Train { .. } => self.shape.row(),
            Task::Infer => x_size,
        };
        let len = self.shard.payload.len();
        if len % row != 0 || len / row != self.shard.len() {
            return Err(SerializationError::RaggedRows { len, row });
        }

        let params = self.store.len();
        if params > u32::MAX as usize + 1 {
            return Err(SerializationError::IndexOverflow { len: params });
        }

        Ok(())
    }

    /// The command announcing `delta`, `Step` or `Forward` depending on the task.
    pub fn command(&self, delta: &ParamDelta) -> Command {
        match self.task {
            Task::Train { criterion_kind } => Command::Step(StepSpec {
                run_id: self.run_id,
                model_id: self.model_id.to_string(),
                model_kind: self.model_kind.to_string(),
                criterion_kind: criterion_kind.to_string(),
                x_size: self.shape.x_size,
                y_size: self.shape.y_size,
                samples: self.shard.len(),
                delta: delta.spec(),
            }),
            Task::Infer => Command::Forward(ForwardSpec {
                run_id: self.run_id,
                model_id: self.model_id.to_string(),
                model_kind: self.model_kind.to_string(),
                x_size: self.shape.x_size,
                y_size: self.shape.y_size,
                samples: self.shard.len(),
                delta: delta.spec(),
            }),
        }
    }
}

/// A worker's answer to a `Step` or `Forward`.
#[derive(Debug)]
pub struct Reply {
    pub report: StepReport,
    /// The gradient of a step or the outputs of a forward pass, present when the
    /// report is `Ok`.
    pub data: Option<Vec<f32>>,
}

fn invalid(detail: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}

/// Sends a request over `link` and waits for its reply.
///
/// The link is flagged as in flight until the whole reply was read, so a caller
/// dropping this future halfway leaves a link that must not be reused.
///
/// # Arguments
/// * `link` - An authenticated link to the worker.
/// * `request` - The shard and what to do with it.
/// * `delta` - The parameter frame to bring the worker's replica up to date.
///
/// # Errors
/// Returns `io::Error` if the link breaks or the worker answers out of protocol.
pub async fn exchange(
    link: &mut Link,
    request: &StepRequest<'_>,
    delta: &ParamDelta,
) -> io::Result<Reply> {
    link.in_flight = true;

    link.tx.send(&Msg::Control(request.command(delta))).await?;

    match delta {
        ParamDelta::Current { .. } => {}
        ParamDelta::Incremental {
            indices, values, ..
        } => {
            let msg = Msg::Data(Payload::Delta { indices, values });
            link.tx.send(&msg).await?;
        }
        ParamDelta::Full { params, .. } => {
            link.tx.send(&Msg::Data(Payload::Params(params))).await?;
        }
    }

    link.tx
        .send(&Msg::Data(Payload::Shard(request.shard.payload.as_slice())))
        .await?;

    let report = match link.rx.recv_into::<Msg, _>(&mut link.buf).await? {
        Msg::Control(Command::StepDone(report)) => report,
        Msg::Err(e) => return Err(invalid(format!("worker refused the request: {e}"))),
        msg => return Err(invalid(format!("expected control/step_done, got {}", msg.kind()))),
    };

    if report.run_id != request.run_id {
        return Err(invalid(format!(
            "reply for run {} while waiting for run {}",
            report.run_id, request.run_id
        )));
    }

    let data = match report.status {
        StepStatus::Ok => match (request.task, link.rx.recv_into::<Msg, _>(&mut link.buf).await?) {
            (Task::Train { .. }, Msg::Data(Payload::Gradient(grad))) => Some(grad.to_vec()),
            (Task::Infer, Msg::Data(Payload::Outputs(outputs))) => Some(outputs.to_vec()),
            (Task::Train { .. }, msg) => {
                return Err(invalid(format!("expected data/gradient, got {}", msg.kind())));
            }
            (Task::Infer, msg) => {
                return Err(invalid(format!("expected data/outputs, got {}", msg.kind())));
            }
        },
        StepStatus::Failed(_) => None,
    };

    link.in_flight = false;
    Ok(Reply { report, data })
}

/// Turns a worker's reply into the partial result of `owner`.
pub fn into_partial(owner: &str, reply: Reply) -> PartialResult {
    let Reply { report, data } = reply;

    match report.status {
        StepStatus::Ok => PartialResult::ok(
            owner,
            report.loss,
            data.unwrap_or_default(),
            report.sample_count,
        ),
        StepStatus::Failed(failure) => PartialResult::failed(owner, failure_reason(failure)),
    }
}

/// Turns a worker's reply to a forward pass into its outputs.
pub fn into_outputs(reply: Reply) -> Result<Vec<f32>, FailureReason> {
    match reply.report.status {
        StepStatus::Ok => Ok(reply.data.unwrap_or_default()),
        StepStatus::Failed(failure) => Err(failure_reason(failure)),
    }
}

fn failure_reason(failure: RemoteFailure) -> FailureReason {
    match failure {
        RemoteFailure::Execution { detail } => FailureReason::Remote(detail),
        RemoteFailure::StaleReplica { have, want } => FailureReason::StaleReplica { have, want },
        RemoteFailure::Protocol { detail } => FailureReason::Protocol(detail),
    }
}

/// Runs a shard on this machine, with the trainer's current parameters.
///
/// # Arguments
/// * `owner` - The name of the in-process worker.
/// * `request` - The step to run.
/// * `model` - The resolved model kind.
/// * `criterion` - The resolved criterion kind.
/// * `deadline` - How long the computation may take.
pub async fn run_local(
    owner: &str,
    request: &StepRequest<'_>,
    model: Arc<dyn Model>,
    criterion: Arc<dyn Criterion>,
    deadline: Duration,
) -> Result<PartialResult, SerializationError> {
    request.validate()?;

    let (_, params) = request.store.snapshot();
    let rows = request.shard.payload.clone();
    let shape = request.shape;

    let compute = task::spawn_blocking(move || {
        worker::executor::compute(model.as_ref(), criterion.as_ref(), shape, &params, &rows)
    });

    let result = match time::timeout(deadline, compute).await {
        Ok(Ok(Ok(outcome))) => {
            PartialResult::ok(owner, outcome.loss, outcome.grad, outcome.sample_count)
        }
        Ok(Ok(Err(e))) => PartialResult::failed(owner, local_failure(e)),
        Ok(Err(e)) => PartialResult::failed(owner, FailureReason::Remote(e.to_string())),
        Err(_) => PartialResult::failed(owner, FailureReason::Timeout),
    };

    Ok(result)
}

/// Computes the outputs of a shard of inputs on this machine.
pub async fn infer_local(
    request: &StepRequest<'_>,
    model: Arc<dyn Model>,
    deadline: Duration,
) -> Result<Result<Vec<f32>, FailureReason>, SerializationError> {
    request.validate()?;

    let (_, params) = request.store.snapshot();
    let inputs = request.shard.payload.clone();
    let shape = request.shape;

    let compute = task::spawn_blocking(move || {
        worker::executor::forward(model.as_ref(), shape, &params, &inputs)
    });

    let outputs = match time::timeout(deadline, compute).await {
        Ok(Ok(Ok(outputs))) => Ok(outputs),
        Ok(Ok(Err(e))) => Err(local_failure(e)),
        Ok(Err(e)) => Err(FailureReason::Remote(e.to_string())),
        Err(_) => Err(FailureReason::Timeout),
    };

    Ok(outputs)
}

fn local_failure(e: WorkerErr) -> FailureReason {
    failure_reason(e.into_failure())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::optimization::OptimizerSpec;

    fn store() -> ParameterStore {
        ParameterStore::new(
            vec![1.0, 0.0],
            &OptimizerSpec::GradientDescent { lr: 0.1 },
            NonZeroUsize::new(8).unwrap(),
        )
    }

    fn shard(payload: Vec<f32>, samples: usize) -> Shard {
        Shard {
            owner: "local".into(),
            sample_range: 0..samples,
            payload,
        }
    }

    fn request<'a>(store: &'a ParameterStore, shard: &'a Shard) -> StepRequest<'a> {
        StepRequest {
            run_id: 1,
            model_id: "model_0",
            model_kind: "linear",
            task: Task::Train {
                criterion_kind: "mse",
            },
            shape: Shape::new(1, 1),
            store,
            shard,
        }
    }

    #[test]
    fn ragged_payload_is_rejected() {
        let store = store();
        let shard = shard(vec![1.0, 2.0, 3.0], 2);
        assert!(matches!(
            request(&store, &shard).validate(),
            Err(SerializationError::RaggedRows { .. })
        ));
    }

    #[test]
    fn command_carries_the_delta_header() {
        let store = store();
        let shard = shard(vec![1.0, 2.0], 1);
        let delta = store.delta_for(None);

        let Command::Step(spec) = request(&store, &shard).command(&delta) else {
            panic!("training asks for a step");
        };
        assert_eq!(spec.samples, 1);
        assert_eq!(spec.criterion_kind, "mse");
        assert_eq!(spec.delta.target(), 0);
    }

    #[test]
    fn inference_sends_inputs_only() {
        let store = store();
        let shard = shard(vec![1.0, 2.0, 3.0], 3);
        let request = StepRequest {
            task: Task::Infer,
            ..request(&store, &shard)
        };

        assert!(request.validate().is_ok());
        assert!(matches!(
            request.command(&store.delta_for(None)),
            Command::Forward(ForwardSpec { samples: 3, .. })
        ));
    }

    #[test]
    fn remote_failures_map_to_reasons() {
        let reply = Reply {
            report: StepReport {
                run_id: 1,
                loss: 0.0,
                sample_count: 0,
                status: StepStatus::Failed(RemoteFailure::StaleReplica {
                    have: Some(1),
                    want: 3,
                }),
            },
            data: None,
        };

        let partial = into_partial("w", reply);
        assert_eq!(
            partial.status,
            crate::report::Status::Failed(FailureReason::StaleReplica {
                have: Some(1),
                want: 3
            })
        );
    }

    #[tokio::test]
    async fn local_step_uses_the_store() {
        let store = store();
        let shard = shard(vec![1.0, 1.0, 2.0, 2.0], 2);
        let registry = worker::Registry::with_builtins();

        let result = run_local(
            "local",
            &request(&store, &shard),
            registry.model("linear").unwrap(),
            registry.criterion("mse").unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(result.loss, 0.0);
        assert_eq!(result.sample_count, 2);
    }
}
