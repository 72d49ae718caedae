use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

/// Adam, with the bias correction folded into the step size.
#[derive(Debug)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the chunk it updates.
    /// * `lr` - The learning rate.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters of the algorithm.
    pub fn new(len: usize, lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatchErr> {
        check_sizes(grad, params)?;
        check_sizes(&self.m, params)?;

        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;

        let step_size = self.lr * (1. - self.beta2_t).sqrt() / (1. - self.beta1_t);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = b1 * *m + (1. - b1) * g;
            *v = b2 * *v + (1. - b2) * g * g;
            *p -= step_size * *m / (v.sqrt() + eps);
        }

        Ok(())
    }
}
