mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

use serde::{Deserialize, Serialize};

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::{Optimizer, SizeMismatchErr};

/// Selects the optimizer a model's parameters are updated with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSpec {
    GradientDescent {
        lr: f32,
    },
    GradientDescentWithMomentum {
        lr: f32,
        momentum: f32,
    },
    Adam {
        lr: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

impl OptimizerSpec {
    /// Adam with the usual `0.9`, `0.999` and `1e-8` hyperparameters.
    pub fn adam(lr: f32) -> Self {
        Self::Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    /// Builds an optimizer for a chunk of `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer + Send + Sync> {
        match *self {
            Self::GradientDescent { lr } => Box::new(GradientDescent::new(lr)),
            Self::GradientDescentWithMomentum { lr, momentum } => {
                Box::new(GradientDescentWithMomentum::new(len, lr, momentum))
            }
            Self::Adam {
                lr,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(len, lr, beta1, beta2, epsilon)),
        }
    }
}
