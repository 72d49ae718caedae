use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::time;
use worker::{Registry, Shape};

use crate::{
    aggregate::aggregate,
    config::{ClusterConfig, ResourceDescriptor},
    connection::{ConnectionManager, Connector, RetryPolicy, TcpConnector},
    dataset::{Batch, Shard},
    error::{ConfigurationError, ConnectError, InferenceError, Result, StateError, TrainerError},
    handle::{CriterionHandle, ModelHandle},
    optimization::OptimizerSpec,
    partition::partition,
    report::{AggregatedResult, FailureReason, PartialResult, RunReport},
    stub::{self, StepRequest, Task},
};

/// Knobs of a `Trainer` that don't belong to the cluster description.
#[derive(Clone)]
pub struct TrainerOptions {
    pub retry: RetryPolicy,
    /// Bound on a single round-trip with a worker.
    pub step_timeout: Duration,
    /// Bound on a worker's whole part of a run, reconnects and retries included.
    pub run_timeout: Duration,
    /// Parameters per optimizer chunk.
    pub chunk_size: NonZeroUsize,
    /// The model and criterion kinds the trainer can register.
    pub registry: Registry,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60),
            chunk_size: NonZeroUsize::new(4096).unwrap_or(NonZeroUsize::MIN),
            registry: Registry::with_builtins(),
        }
    }
}

/// Distributes training steps over the workers of a `ClusterConfig`.
pub struct Trainer {
    id: u64,
    config: ClusterConfig,
    registry: Registry,
    connections: ConnectionManager,
    step_timeout: Duration,
    run_timeout: Duration,
    chunk_size: NonZeroUsize,
    models: AtomicUsize,
    runs: AtomicU64,
    write_lock: Mutex<()>,
}

impl Trainer {
    /// Creates a trainer reaching its remote workers over TCP.
    ///
    /// # Errors
    /// A `ConfigurationError` if `config` has no workers.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TcpConnector), TrainerOptions::default())
    }

    /// Creates a trainer reaching its remote workers through `connector`.
    ///
    /// # Arguments
    /// * `config` - The workers to train on.
    /// * `connector` - Opens transports to the remote workers.
    /// * `options` - Timeouts, retries and the local registry.
    pub fn with_connector(
        config: ClusterConfig,
        connector: Arc<dyn Connector>,
        options: TrainerOptions,
    ) -> Result<Self> {
        if config.is_empty() {
            return Err(ConfigurationError::NoWorkers.into());
        }

        let TrainerOptions {
            retry,
            step_timeout,
            run_timeout,
            chunk_size,
            registry,
        } = options;

        let trainer = Self {
            id: rand::random(),
            connections: ConnectionManager::new(connector, retry, step_timeout),
            config,
            registry,
            step_timeout,
            run_timeout,
            chunk_size,
            models: AtomicUsize::new(0),
            runs: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };

        info!(
            "trainer ready with {} worker(s), {} of them remote",
            trainer.config.len(),
            trainer.remote_workers().count()
        );

        Ok(trainer)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn remote_workers(&self) -> impl Iterator<Item = (&str, &ResourceDescriptor)> {
        self.config.workers().filter(|(_, d)| !d.is_local())
    }

    /// Connects and authenticates every remote worker.
    ///
    /// # Errors
    /// The `ConnectError` of the first worker, in configuration order, that failed.
    pub async fn connect_all(&self) -> Result<()> {
        let connects = self
            .remote_workers()
            .map(|(name, descriptor)| self.connections.connect(name, descriptor));

        for result in future::join_all(connects).await {
            result?;
        }

        Ok(())
    }

    /// Registers a model of `kind` starting at `params`.
    ///
    /// # Errors
    /// A `ConfigurationError` if `kind` isn't in the registry.
    pub fn register_model(
        &self,
        kind: &str,
        params: Vec<f32>,
        optimizer: &OptimizerSpec,
    ) -> Result<ModelHandle> {
        let model = self.registry.model(kind)?;
        let index = self.models.fetch_add(1, Ordering::Relaxed);

        let handle = ModelHandle::new(
            self.id,
            index,
            kind,
            model,
            crate::store::ParameterStore::new(params, optimizer, self.chunk_size),
        );

        debug!(model_id = handle.id(); "registered {kind} with {} parameter(s)", handle.store().len());
        Ok(handle)
    }

    /// Binds a criterion of `kind` to `model`.
    pub fn register_criterion(&self, model: &ModelHandle, kind: &str) -> Result<CriterionHandle> {
        self.check_owner(model)?;
        let criterion = self.registry.criterion(kind)?;

        Ok(CriterionHandle::new(model, kind, criterion))
    }

    fn check_owner(&self, model: &ModelHandle) -> Result<()> {
        if model.trainer_id() != self.id {
            return Err(StateError::ForeignHandle.into());
        }

        Ok(())
    }

    fn check_size(model: &ModelHandle, shape: Shape) -> Result<()> {
        let expected = model.model().size(shape);
        if expected != model.store().len() {
            return Err(ConfigurationError::SizeMismatch {
                what: "params",
                got: model.store().len(),
                expected,
            }
            .into());
        }

        Ok(())
    }

    /// Runs one training step of `criterion`'s model over `batch`.
    ///
    /// The batch is split across the workers, every worker computes the loss and
    /// gradient of its shard concurrently, and the combined gradient is applied to
    /// the model once. Workers that fail or time out are left out of the step and
    /// listed in the report.
    ///
    /// # Errors
    /// A `ConfigurationError` if the batch doesn't fit the model or the cluster, an
    /// `AggregationError` if no worker contributed. The parameters are only
    /// touched on success.
    pub async fn run(&self, criterion: &CriterionHandle, batch: &Batch) -> Result<RunReport> {
        let model = criterion.model();
        self.check_owner(model)?;

        let shape = batch.shape();
        Self::check_size(model, shape)?;

        let assignments = partition(batch.len(), &self.config)?;
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let _scope = criterion.enter_run();

        info!(
            run_id = run_id, model_id = model.id();
            "dispatching {} sample(s) to {} worker(s)",
            batch.len(),
            assignments.len()
        );

        let shards: Vec<Shard> = assignments.iter().map(|a| batch.shard(a)).collect();
        let dispatches = shards
            .iter()
            .map(|shard| self.dispatch(run_id, criterion, shape, shard));

        let results = future::join_all(dispatches)
            .await
            .into_iter()
            .collect::<Result<Vec<PartialResult>>>()?;

        let aggregate = aggregate(&assignments, results, model.store().len())?;

        let version = {
            let _write = self.write_lock.lock();
            model
                .store()
                .apply(&aggregate.grad)
                .map_err(|e| ConfigurationError::SizeMismatch {
                    what: "gradient",
                    got: e.got,
                    expected: e.expected,
                })?
        };

        let result = AggregatedResult {
            loss: aggregate.loss,
            sample_count: aggregate.sample_count,
            applied: true,
        };
        criterion.cache(result);

        info!(
            run_id = run_id, model_id = model.id();
            "loss {:.6} over {} sample(s), now at version {version}",
            result.loss,
            result.sample_count
        );

        Ok(RunReport {
            result,
            contributors: aggregate.contributors,
            dropped: aggregate.dropped,
            version,
        })
    }

    async fn dispatch(
        &self,
        run_id: u64,
        criterion: &CriterionHandle,
        shape: Shape,
        shard: &Shard,
    ) -> Result<PartialResult> {
        let owner = shard.owner.as_str();
        let model = criterion.model();

        let descriptor = self
            .config
            .worker(owner)
            .ok_or_else(|| ConfigurationError::UnknownWorker(owner.to_string()))?;

        let request = StepRequest {
            run_id,
            model_id: model.replica_id(),
            model_kind: model.kind(),
            task: Task::Train {
                criterion_kind: criterion.kind(),
            },
            shape,
            store: model.store(),
            shard,
        };

        let work = async {
            if descriptor.is_local() {
                stub::run_local(
                    owner,
                    &request,
                    model.model_arc(),
                    criterion.criterion_arc(),
                    self.step_timeout,
                )
                .await
            } else {
                let channel = self.connections.channel(owner, descriptor);
                self.connections.send_shard(&channel, &request).await
            }
        };

        let result = match time::timeout(self.run_timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(worker = owner, run_id = run_id; "gave up waiting for the worker");
                PartialResult::failed(owner, FailureReason::Timeout)
            }
        };

        Ok(result)
    }

    /// Computes the outputs of `model` for the inputs of `batch`, split across the
    /// workers like a run.
    ///
    /// The targets of `batch` only give the output width and never leave this
    /// machine. Worker replicas are brought up to date on the way, and a worker
    /// whose replica turns out stale is sent the full parameters once more.
    ///
    /// # Returns
    /// `y_size` outputs per sample, row-major, in batch order.
    ///
    /// # Errors
    /// A `ConfigurationError` if the batch doesn't fit the model or the cluster,
    /// an `InferenceError` if any worker failed its shard.
    pub async fn forward(&self, model: &ModelHandle, batch: &Batch) -> Result<Vec<f32>> {
        self.check_owner(model)?;

        let shape = batch.shape();
        Self::check_size(model, shape)?;

        let assignments = partition(batch.len(), &self.config)?;
        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            run_id = run_id, model_id = model.id();
            "forward over {} sample(s) on {} worker(s)",
            batch.len(),
            assignments.len()
        );

        let inputs = batch.inputs();
        let shards: Vec<Shard> = assignments
            .iter()
            .map(|a| Shard {
                owner: a.owner.clone(),
                sample_range: a.sample_range.clone(),
                payload: inputs[a.sample_range.start * shape.x_size..a.sample_range.end * shape.x_size]
                    .to_vec(),
            })
            .collect();

        let calls = shards
            .iter()
            .map(|shard| self.infer(run_id, model, shape, shard));

        let mut outputs = Vec::with_capacity(batch.len() * shape.y_size);
        let mut dropped = Vec::new();

        for (shard, result) in shards.iter().zip(future::join_all(calls).await) {
            match result? {
                Ok(out) if out.len() == shard.len() * shape.y_size => outputs.extend(out),
                Ok(out) => {
                    let reason = FailureReason::Corrupt(format!(
                        "{} outputs for {} sample(s)",
                        out.len(),
                        shard.len()
                    ));
                    dropped.push((shard.owner.clone(), reason));
                }
                Err(reason) => dropped.push((shard.owner.clone(), reason)),
            }
        }

        if !dropped.is_empty() {
            return Err(InferenceError { dropped }.into());
        }

        Ok(outputs)
    }

    async fn infer(
        &self,
        run_id: u64,
        model: &ModelHandle,
        shape: Shape,
        shard: &Shard,
    ) -> Result<std::result::Result<Vec<f32>, FailureReason>> {
        let owner = shard.owner.as_str();

        let descriptor = self
            .config
            .worker(owner)
            .ok_or_else(|| ConfigurationError::UnknownWorker(owner.to_string()))?;

        let request = StepRequest {
            run_id,
            model_id: model.replica_id(),
            model_kind: model.kind(),
            task: Task::Infer,
            shape,
            store: model.store(),
            shard,
        };

        let work = async {
            if descriptor.is_local() {
                return stub::infer_local(&request, model.model_arc(), self.step_timeout).await;
            }

            let channel = self.connections.channel(owner, descriptor);
            match self.connections.send_inputs(&channel, &request).await {
                Ok(Err(FailureReason::StaleReplica { have, want })) => {
                    debug!(worker = owner, run_id = run_id; "replica at {have:?}, wanted {want}, resending");
                    self.connections.send_inputs(&channel, &request).await
                }
                other => other,
            }
        };

        match time::timeout(self.run_timeout, work).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(worker = owner, run_id = run_id; "gave up waiting for the worker");
                Ok(Err(FailureReason::Timeout))
            }
        }
    }

    /// Trains `criterion`'s model for `epochs` passes over `dataset`.
    ///
    /// Each step takes `base_batch * batch_size_multiplier` samples. A trailing
    /// batch too small to cover every worker is skipped.
    ///
    /// # Returns
    /// The report of every step, in order.
    pub async fn fit(
        &self,
        criterion: &CriterionHandle,
        dataset: &Batch,
        base_batch: usize,
        epochs: usize,
    ) -> Result<Vec<RunReport>> {
        let batch_size = base_batch.saturating_mul(self.config.batch_size_multiplier().get());
        if batch_size == 0 {
            return Err(ConfigurationError::BatchTooSmall {
                batch_size,
                active: self.config.len(),
            }
            .into());
        }

        let mut reports = Vec::new();

        for epoch in 0..epochs {
            for batch in dataset.chunks(batch_size) {
                match self.run(criterion, &batch).await {
                    Ok(report) => reports.push(report),
                    Err(TrainerError::Configuration(ConfigurationError::BatchTooSmall {
                        ..
                    })) if batch.len() < batch_size => {
                        debug!("skipping a trailing batch of {} sample(s)", batch.len());
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(last) = reports.last() {
                info!(epoch = epoch; "epoch done, last loss {:.6}", last.result.loss);
            }
        }

        Ok(reports)
    }

    /// Pings every remote worker.
    ///
    /// # Returns
    /// The round-trip latency or the error of each remote worker, in configuration order.
    pub async fn health(&self) -> Vec<(String, std::result::Result<Duration, ConnectError>)> {
        let probes = self.remote_workers().map(|(name, descriptor)| async move {
            let channel = self.connections.channel(name, descriptor);
            (name.to_string(), self.connections.probe(&channel).await)
        });

        future::join_all(probes).await
    }

    /// Closes the channel to every remote worker. A later run connects again.
    ///
    /// Workers drop the replicas this trainer left on them.
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
        info!("trainer shut down");
    }
}
