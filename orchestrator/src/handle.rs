//! Handles to the models and criteria registered with a `Trainer`.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use worker::{Criterion, Model};

use crate::{
    dataset::Batch,
    error::{Result, StateError},
    report::AggregatedResult,
    store::ParameterStore,
};

/// The last aggregated loss of a handle, plus how many runs are using it.
#[derive(Debug, Default)]
struct LossCache {
    value: Mutex<Option<AggregatedResult>>,
    active_runs: AtomicUsize,
}

impl LossCache {
    fn get(&self) -> Result<AggregatedResult> {
        self.value.lock().ok_or_else(|| StateError::LossUnset.into())
    }

    fn set(&self, result: AggregatedResult) {
        *self.value.lock() = Some(result);
    }

    fn clear(&self) {
        *self.value.lock() = None;
    }

    fn in_run(&self) -> bool {
        self.active_runs.load(Ordering::Acquire) > 0
    }

    fn enter(&self) -> RunGuard<'_> {
        self.active_runs.fetch_add(1, Ordering::AcqRel);
        RunGuard { cache: self }
    }
}

/// Marks its cache as used by a run until dropped.
struct RunGuard<'a> {
    cache: &'a LossCache,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.cache.active_runs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps both handles of a run marked as in flight.
pub(crate) struct RunScope<'a> {
    _model: RunGuard<'a>,
    _criterion: RunGuard<'a>,
}

struct ModelInner {
    trainer_id: u64,
    id: String,
    replica_id: String,
    kind: String,
    model: Arc<dyn Model>,
    store: ParameterStore,
    cache: LossCache,
    criterion: Mutex<Option<(String, Arc<dyn Criterion>)>>,
}

/// A model registered with a `Trainer`.
///
/// Cloning a handle is cheap and every clone refers to the same model.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<ModelInner>,
}

impl ModelHandle {
    pub(crate) fn new(
        trainer_id: u64,
        index: usize,
        kind: &str,
        model: Arc<dyn Model>,
        store: ParameterStore,
    ) -> Self {
        let id = format!("model_{index}");

        Self {
            inner: Arc::new(ModelInner {
                trainer_id,
                replica_id: format!("{trainer_id:016x}/{id}"),
                id,
                kind: kind.to_string(),
                model,
                store,
                cache: LossCache::default(),
                criterion: Mutex::new(None),
            }),
        }
    }

    /// The id the trainer registered the model under, `model_N`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// The parameters as of now.
    pub fn params(&self) -> Vec<f32> {
        self.inner.store.snapshot().1.to_vec()
    }

    /// The version of the parameters, bumped by every applied run.
    pub fn version(&self) -> u64 {
        self.inner.store.version()
    }

    /// Runs the model on the inputs of `batch`, on this machine.
    ///
    /// # Returns
    /// `y_size` outputs per sample, row-major.
    pub fn forward(&self, batch: &Batch) -> Result<Vec<f32>> {
        let (_, params) = self.inner.store.snapshot();
        let outputs =
            worker::executor::forward(self.model(), batch.shape(), &params, &batch.inputs())?;
        Ok(outputs)
    }

    /// The loss of the model on `batch`, with the criterion it was last registered with.
    ///
    /// While a run on the model is in flight the loss it last cached is returned
    /// instead.
    pub fn evaluate(&self, batch: &Batch) -> Result<f64> {
        if self.inner.cache.in_run() {
            return Ok(self.get_loss()?.loss);
        }

        let Some((_, criterion)) = self.inner.criterion.lock().clone() else {
            return Err(StateError::NoCriterion.into());
        };

        self.compute_loss(criterion.as_ref(), batch)
    }

    /// The most recently aggregated result.
    pub fn get_loss(&self) -> Result<AggregatedResult> {
        self.inner.cache.get()
    }

    pub fn set_loss(&self, result: AggregatedResult) {
        self.inner.cache.set(result);
    }

    pub fn clear_loss(&self) {
        self.inner.cache.clear();
    }

    fn compute_loss(&self, criterion: &dyn Criterion, batch: &Batch) -> Result<f64> {
        let (_, params) = self.inner.store.snapshot();
        let loss = worker::executor::evaluate(
            self.model(),
            criterion,
            batch.shape(),
            &params,
            batch.data(),
        )?;
        Ok(loss)
    }

    pub(crate) fn trainer_id(&self) -> u64 {
        self.inner.trainer_id
    }

    /// The id worker replicas of this model are stored under, unique per trainer.
    pub fn replica_id(&self) -> &str {
        &self.inner.replica_id
    }

    pub(crate) fn model(&self) -> &dyn Model {
        self.inner.model.as_ref()
    }

    pub(crate) fn model_arc(&self) -> Arc<dyn Model> {
        Arc::clone(&self.inner.model)
    }

    pub(crate) fn store(&self) -> &ParameterStore {
        &self.inner.store
    }

    pub(crate) fn set_criterion(&self, kind: &str, criterion: Arc<dyn Criterion>) {
        *self.inner.criterion.lock() = Some((kind.to_string(), criterion));
    }
}

struct CriterionInner {
    kind: String,
    criterion: Arc<dyn Criterion>,
    model: ModelHandle,
    cache: LossCache,
}

/// A loss function bound to a registered model. `Trainer::run` takes one of these.
#[derive(Clone)]
pub struct CriterionHandle {
    inner: Arc<CriterionInner>,
}

impl CriterionHandle {
    pub(crate) fn new(model: &ModelHandle, kind: &str, criterion: Arc<dyn Criterion>) -> Self {
        model.set_criterion(kind, Arc::clone(&criterion));

        Self {
            inner: Arc::new(CriterionInner {
                kind: kind.to_string(),
                criterion,
                model: model.clone(),
                cache: LossCache::default(),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// The model this criterion scores.
    pub fn model(&self) -> &ModelHandle {
        &self.inner.model
    }

    /// The loss of the model on `batch` under this criterion.
    ///
    /// While a run with this criterion is in flight the loss it last cached is
    /// returned instead.
    pub fn evaluate(&self, batch: &Batch) -> Result<f64> {
        if self.inner.cache.in_run() {
            return Ok(self.get_loss()?.loss);
        }

        self.inner
            .model
            .compute_loss(self.inner.criterion.as_ref(), batch)
    }

    pub fn get_loss(&self) -> Result<AggregatedResult> {
        self.inner.cache.get()
    }

    pub fn set_loss(&self, result: AggregatedResult) {
        self.inner.cache.set(result);
    }

    pub fn clear_loss(&self) {
        self.inner.cache.clear();
    }

    pub(crate) fn criterion_arc(&self) -> Arc<dyn Criterion> {
        Arc::clone(&self.inner.criterion)
    }

    /// Marks this criterion and its model as used by a run.
    pub(crate) fn enter_run(&self) -> RunScope<'_> {
        RunScope {
            _model: self.inner.model.inner.cache.enter(),
            _criterion: self.inner.cache.enter(),
        }
    }

    /// Caches `result` in this criterion and in its model.
    pub(crate) fn cache(&self, result: AggregatedResult) {
        self.inner.cache.set(result);
        self.inner.model.set_loss(result);
    }
}
