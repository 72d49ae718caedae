use std::{collections::HashMap, sync::Arc};

use comms::specs::step::{ForwardSpec, StepSpec};
use log::debug;
use parking_lot::Mutex;

use crate::{
    Result, WorkerErr,
    model::{Criterion, Model, Shape},
    registry::Registry,
};

/// A parameter update received from the orchestrator, borrowed from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta<'a> {
    /// The replica must already be at `version`.
    Current { version: u64 },
    /// Absolute values for the parameters that changed between `from` and `to`.
    Incremental {
        from: u64,
        to: u64,
        indices: &'a [u32],
        values: &'a [f32],
    },
    /// The complete parameters at version `to`.
    Full { to: u64, params: &'a [f32] },
}

#[derive(Debug, Clone)]
struct Replica {
    version: u64,
    params: Arc<Vec<f32>>,
}

/// The result of running a shard through a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub loss: f64,
    pub grad: Vec<f32>,
    pub sample_count: usize,
}

/// Keeps the model replicas of a worker and runs steps over them.
///
/// Shared by every connection the worker serves, replicas are keyed by model id.
pub struct Executor {
    registry: Registry,
    replicas: Mutex<HashMap<String, Replica>>,
}

impl Executor {
    /// Creates a new `Executor` with no replicas.
    ///
    /// # Arguments
    /// * `registry` - Resolves the model and criterion kinds of incoming steps.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            replicas: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The version of the replica of `model_id`, if there is one.
    pub fn version(&self, model_id: &str) -> Option<u64> {
        self.replicas.lock().get(model_id).map(|r| r.version)
    }

    /// A copy of the replica parameters of `model_id`, if there is one.
    pub fn params(&self, model_id: &str) -> Option<Vec<f32>> {
        self.replicas
            .lock()
            .get(model_id)
            .map(|r| r.params.as_ref().clone())
    }

    /// Amount of replicas held.
    pub fn len(&self) -> usize {
        self.replicas.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.lock().is_empty()
    }

    /// Drops the replica of `model_id`.
    ///
    /// # Returns
    /// Whether there was one.
    pub fn remove(&self, model_id: &str) -> bool {
        self.replicas.lock().remove(model_id).is_some()
    }

    /// Drops every replica, as if the worker had restarted.
    pub fn forget(&self) {
        self.replicas.lock().clear();
    }

    /// Brings the replica of `model_id` up to date with `delta`.
    ///
    /// An incremental delta is accepted when the replica is at `from`, or at `to` in
    /// which case the values are applied again. Any other state is a stale replica.
    ///
    /// # Returns
    /// The version the replica holds afterwards.
    pub fn sync(&self, model_id: &str, delta: Delta<'_>) -> Result<u64> {
        let mut replicas = self.replicas.lock();
        let have = replicas.get(model_id).map(|r| r.version);

        let stale = |want| WorkerErr::StaleReplica {
            model_id: model_id.to_string(),
            have,
            want,
        };

        match delta {
            Delta::Current { version } => {
                if have != Some(version) {
                    return Err(stale(version));
                }

                Ok(version)
            }
            Delta::Incremental {
                from,
                to,
                indices,
                values,
            } => {
                let Some(replica) = replicas.get_mut(model_id) else {
                    return Err(stale(to));
                };

                if replica.version != from && replica.version != to {
                    return Err(stale(to));
                }

                if indices.len() != values.len() {
                    return Err(WorkerErr::SizeMismatch {
                        what: "delta values",
                        got: values.len(),
                        expected: indices.len(),
                    });
                }

                let len = replica.params.len();
                if let Some(&i) = indices.iter().find(|&&i| i as usize >= len) {
                    return Err(WorkerErr::SizeMismatch {
                        what: "delta index",
                        got: i as usize,
                        expected: len,
                    });
                }

                let params = Arc::make_mut(&mut replica.params);
                for (&i, &v) in indices.iter().zip(values) {
                    params[i as usize] = v;
                }

                replica.version = to;
                debug!(model_id = model_id; "applied incremental delta {from} -> {to}, {} changed", indices.len());
                Ok(to)
            }
            Delta::Full { to, params } => {
                replicas.insert(
                    model_id.to_string(),
                    Replica {
                        version: to,
                        params: Arc::new(params.to_vec()),
                    },
                );

                debug!(model_id = model_id; "replaced replica with version {to}, {} params", params.len());
                Ok(to)
            }
        }
    }

    /// The parameters of `model_id`, which must be at version `want`.
    fn replica_at(&self, model_id: &str, want: u64) -> Result<Arc<Vec<f32>>> {
        let replicas = self.replicas.lock();
        match replicas.get(model_id) {
            Some(r) if r.version == want => Ok(Arc::clone(&r.params)),
            other => Err(WorkerErr::StaleReplica {
                model_id: model_id.to_string(),
                have: other.map(|r| r.version),
                want,
            }),
        }
    }

    /// Runs `rows` through the replica named by `spec`.
    ///
    /// The replica must already be at the version the step targets, see `sync`.
    pub fn step(&self, spec: &StepSpec, rows: &[f32]) -> Result<Outcome> {
        let params = self.replica_at(&spec.model_id, spec.delta.target())?;

        let model = self.registry.model(&spec.model_kind)?;
        let criterion = self.registry.criterion(&spec.criterion_kind)?;
        let shape = Shape::new(spec.x_size, spec.y_size);

        let samples = shape.samples(rows)?;
        if samples != spec.samples {
            return Err(WorkerErr::SizeMismatch {
                what: "shard samples",
                got: samples,
                expected: spec.samples,
            });
        }

        compute(model.as_ref(), criterion.as_ref(), shape, &params, rows)
    }

    /// Computes the outputs of the replica named by `spec` for `inputs`.
    pub fn forward(&self, spec: &ForwardSpec, inputs: &[f32]) -> Result<Vec<f32>> {
        let params = self.replica_at(&spec.model_id, spec.delta.target())?;

        let model = self.registry.model(&spec.model_kind)?;
        let shape = Shape::new(spec.x_size, spec.y_size);

        let size = model.size(shape);
        if params.len() != size {
            return Err(WorkerErr::SizeMismatch {
                what: "params",
                got: params.len(),
                expected: size,
            });
        }

        let expected = spec.samples * spec.x_size;
        if inputs.len() != expected {
            return Err(WorkerErr::SizeMismatch {
                what: "forward inputs",
                got: inputs.len(),
                expected,
            });
        }

        forward(model.as_ref(), shape, &params, inputs)
    }
}

/// Runs forward, loss, loss gradient and backward over `rows`.
///
/// # Arguments
/// * `model` - The model to differentiate.
/// * `criterion` - The loss to minimize.
/// * `shape` - The layout of each sample row.
/// * `params` - The model parameters.
/// * `rows` - Row-major samples.
///
/// # Returns
/// The mean loss over the rows, the gradient of that loss and the amount of samples.
pub fn compute(
    model: &dyn Model,
    criterion: &dyn Criterion,
    shape: Shape,
    params: &[f32],
    rows: &[f32],
) -> Result<Outcome> {
    let size = model.size(shape);
    if params.len() != size {
        return Err(WorkerErr::SizeMismatch {
            what: "params",
            got: params.len(),
            expected: size,
        });
    }

    let sample_count = shape.samples(rows)?;
    let (xs, ys) = shape.split(rows)?;

    let mut out = vec![0.0; ys.len()];
    model.forward(shape, params, &xs, &mut out)?;

    let loss = criterion.loss(&out, &ys)?;
    if !loss.is_finite() {
        return Err(WorkerErr::NonFinite { what: "loss" });
    }

    let mut d_out = vec![0.0; out.len()];
    criterion.grad(&out, &ys, &mut d_out)?;

    let mut grad = vec![0.0; size];
    model.backward(shape, params, &xs, &d_out, &mut grad)?;

    if grad.iter().any(|g| !g.is_finite()) {
        return Err(WorkerErr::NonFinite { what: "gradient" });
    }

    Ok(Outcome {
        loss,
        grad,
        sample_count,
    })
}

/// The loss of `model` over `rows`, without differentiating.
pub fn evaluate(
    model: &dyn Model,
    criterion: &dyn Criterion,
    shape: Shape,
    params: &[f32],
    rows: &[f32],
) -> Result<f64> {
    let (xs, ys) = shape.split(rows)?;
    let mut out = vec![0.0; ys.len()];
    model.forward(shape, params, &xs, &mut out)?;
    criterion.loss(&out, &ys)
}

/// The outputs of `model` for the inputs `xs`.
pub fn forward(model: &dyn Model, shape: Shape, params: &[f32], xs: &[f32]) -> Result<Vec<f32>> {
    if shape.is_empty() || xs.len() % shape.x_size != 0 {
        return Err(WorkerErr::SizeMismatch {
            what: "inputs",
            got: xs.len(),
            expected: xs.len().next_multiple_of(shape.x_size.max(1)),
        });
    }

    let mut out = vec![0.0; xs.len() / shape.x_size * shape.y_size];
    model.forward(shape, params, xs, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use comms::specs::step::DeltaSpec;

    use super::*;

    fn spec(delta: DeltaSpec, samples: usize) -> StepSpec {
        StepSpec {
            run_id: 1,
            model_id: "model_0".into(),
            model_kind: "linear".into(),
            criterion_kind: "mse".into(),
            x_size: 1,
            y_size: 1,
            samples,
            delta,
        }
    }

    fn executor() -> Executor {
        Executor::new(Registry::with_builtins())
    }

    #[test]
    fn incremental_delta_needs_a_replica() {
        let executor = executor();
        let delta = Delta::Incremental {
            from: 0,
            to: 1,
            indices: &[0],
            values: &[1.0],
        };

        let err = executor.sync("model_0", delta).unwrap_err();
        assert!(matches!(
            err,
            WorkerErr::StaleReplica {
                have: None,
                want: 1,
                ..
            }
        ));
    }

    #[test]
    fn incremental_delta_is_idempotent() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 3,
                    params: &[0.0, 0.0],
                },
            )
            .unwrap();

        let delta = Delta::Incremental {
            from: 3,
            to: 4,
            indices: &[1],
            values: &[2.5],
        };
        assert_eq!(executor.sync("model_0", delta).unwrap(), 4);
        assert_eq!(executor.sync("model_0", delta).unwrap(), 4);
        assert_eq!(executor.params("model_0").unwrap(), [0.0, 2.5]);
    }

    #[test]
    fn skipped_version_is_stale() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 1,
                    params: &[0.0, 0.0],
                },
            )
            .unwrap();

        let delta = Delta::Incremental {
            from: 2,
            to: 3,
            indices: &[0],
            values: &[1.0],
        };
        assert!(matches!(
            executor.sync("model_0", delta),
            Err(WorkerErr::StaleReplica { have: Some(1), .. })
        ));
        assert_eq!(executor.version("model_0"), Some(1));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 1,
                    params: &[0.0, 0.0],
                },
            )
            .unwrap();

        let delta = Delta::Incremental {
            from: 1,
            to: 2,
            indices: &[5],
            values: &[1.0],
        };
        assert!(matches!(
            executor.sync("model_0", delta),
            Err(WorkerErr::SizeMismatch { .. })
        ));
        assert_eq!(executor.version("model_0"), Some(1));
    }

    #[test]
    fn step_runs_on_the_replica() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 1,
                    params: &[1.0, 0.0],
                },
            )
            .unwrap();

        // y = x, so a perfect fit.
        let rows = [1.0, 1.0, 2.0, 2.0];
        let outcome = executor
            .step(&spec(DeltaSpec::None { version: 1 }, 2), &rows)
            .unwrap();

        assert_eq!(outcome.loss, 0.0);
        assert_eq!(outcome.grad, [0.0, 0.0]);
        assert_eq!(outcome.sample_count, 2);
    }

    #[test]
    fn step_checks_sample_count() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 1,
                    params: &[1.0, 0.0],
                },
            )
            .unwrap();

        let err = executor
            .step(&spec(DeltaSpec::None { version: 1 }, 3), &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, WorkerErr::SizeMismatch { .. }));
    }

    #[test]
    fn forward_runs_on_the_replica() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 2,
                    params: &[2.0, 1.0],
                },
            )
            .unwrap();

        let spec = ForwardSpec {
            run_id: 1,
            model_id: "model_0".into(),
            model_kind: "linear".into(),
            x_size: 1,
            y_size: 1,
            samples: 3,
            delta: DeltaSpec::None { version: 2 },
        };

        assert_eq!(executor.forward(&spec, &[0.0, 1.0, 2.0]).unwrap(), [1.0, 3.0, 5.0]);
        assert!(matches!(
            executor.forward(&spec, &[0.0, 1.0]),
            Err(WorkerErr::SizeMismatch { .. })
        ));
    }

    #[test]
    fn removed_replica_is_gone() {
        let executor = executor();
        for id in ["a/model_0", "b/model_0"] {
            executor
                .sync(
                    id,
                    Delta::Full {
                        to: 1,
                        params: &[0.0, 0.0],
                    },
                )
                .unwrap();
        }

        assert!(executor.remove("a/model_0"));
        assert!(!executor.remove("a/model_0"));
        assert_eq!(executor.version("a/model_0"), None);
        assert_eq!(executor.len(), 1);
    }

    #[test]
    fn forgotten_replica_is_stale() {
        let executor = executor();
        executor
            .sync(
                "model_0",
                Delta::Full {
                    to: 1,
                    params: &[1.0, 0.0],
                },
            )
            .unwrap();
        executor.forget();

        let err = executor
            .step(&spec(DeltaSpec::None { version: 1 }, 1), &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, WorkerErr::StaleReplica { have: None, .. }));
    }
}
