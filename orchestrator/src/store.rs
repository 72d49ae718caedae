use std::{num::NonZeroUsize, sync::Arc};

use comms::specs::step::DeltaSpec;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::optimization::{Optimizer, OptimizerSpec, SizeMismatchErr};

/// What a worker needs to bring its replica to the store's current version.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamDelta {
    Current {
        version: u64,
    },
    /// Absolute values of the parameters the last write changed.
    Incremental {
        from: u64,
        to: u64,
        indices: Vec<u32>,
        values: Vec<f32>,
    },
    Full {
        to: u64,
        params: Arc<Vec<f32>>,
    },
}

impl ParamDelta {
    /// The header announcing this delta inside a `StepSpec`.
    pub fn spec(&self) -> DeltaSpec {
        match *self {
            Self::Current { version } => DeltaSpec::None { version },
            Self::Incremental { from, to, .. } => DeltaSpec::Incremental { from, to },
            Self::Full { to, .. } => DeltaSpec::Full { to },
        }
    }
}

struct State {
    params: Arc<Vec<f32>>,
    version: u64,
    changed: Vec<u32>,
    optimizers: Vec<Box<dyn Optimizer + Send + Sync>>,
}

/// A model's parameters, versioned.
///
/// Parameters are split in chunks of `chunk_size`, each with its own optimizer
/// state, and a write updates every chunk in parallel.
pub struct ParameterStore {
    state: RwLock<State>,
    chunk_size: NonZeroUsize,
}

impl ParameterStore {
    /// Creates a new `ParameterStore` at version 0.
    ///
    /// # Arguments
    /// * `params` - The initial parameters.
    /// * `optimizer` - The optimizer every chunk is updated with.
    /// * `chunk_size` - The maximum amount of parameters per chunk.
    pub fn new(params: Vec<f32>, optimizer: &OptimizerSpec, chunk_size: NonZeroUsize) -> Self {
        let optimizers = params
            .chunks(chunk_size.get())
            .map(|chunk| optimizer.build(chunk.len()))
            .collect();

        Self {
            state: RwLock::new(State {
                params: Arc::new(params),
                version: 0,
                changed: Vec::new(),
                optimizers,
            }),
            chunk_size,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// The current version and parameters, consistent with each other.
    pub fn snapshot(&self) -> (u64, Arc<Vec<f32>>) {
        let state = self.state.read();
        (state.version, Arc::clone(&state.params))
    }

    /// The cheapest delta that moves a replica at `replica` to the current version.
    ///
    /// # Arguments
    /// * `replica` - The version the worker is known to hold, if any.
    pub fn delta_for(&self, replica: Option<u64>) -> ParamDelta {
        let state = self.state.read();
        let version = state.version;

        match replica {
            Some(have) if have == version => ParamDelta::Current { version },
            Some(have) if have + 1 == version => ParamDelta::Incremental {
                from: have,
                to: version,
                values: state.changed.iter().map(|&i| state.params[i as usize]).collect(),
                indices: state.changed.clone(),
            },
            _ => ParamDelta::Full {
                to: version,
                params: Arc::clone(&state.params),
            },
        }
    }

    /// Moves the parameters along `grad` and bumps the version.
    ///
    /// # Returns
    /// The new version, or a `SizeMismatchErr` leaving the parameters untouched.
    pub fn apply(&self, grad: &[f32]) -> Result<u64, SizeMismatchErr> {
        let mut state = self.state.write();

        if grad.len() != state.params.len() {
            return Err(SizeMismatchErr {
                got: grad.len(),
                expected: state.params.len(),
            });
        }

        let chunk_size = self.chunk_size.get();
        let State {
            params, optimizers, ..
        } = &mut *state;

        let changed: Vec<Vec<u32>> = Arc::make_mut(params)
            .par_chunks_mut(chunk_size)
            .zip(grad.par_chunks(chunk_size))
            .zip(optimizers.par_iter_mut())
            .enumerate()
            .map(|(i, ((chunk, grad), optimizer))| {
                let before = chunk.to_vec();
                optimizer.update_params(grad, chunk)?;

                let changed: Vec<u32> = before
                    .iter()
                    .zip(chunk.iter())
                    .enumerate()
                    .filter(|(_, (old, new))| old.to_bits() != new.to_bits())
                    .map(|(j, _)| (i * chunk_size + j) as u32)
                    .collect();

                Ok(changed)
            })
            .collect::<Result<_, SizeMismatchErr>>()?;

        state.changed = changed.concat();
        state.version += 1;
        Ok(state.version)
    }
}
