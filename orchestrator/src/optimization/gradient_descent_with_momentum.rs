use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

/// Gradient descent with a velocity term, `v = mu * v + g` then `p -= lr * v`.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    lr: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the chunk it updates.
    /// * `lr` - The learning rate.
    /// * `momentum` - How much of the previous velocity carries over.
    pub fn new(len: usize, lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatchErr> {
        check_sizes(grad, params)?;
        check_sizes(&self.velocity, params)?;

        let (lr, mu) = (self.lr, self.momentum);

        for ((p, g), v) in params.iter_mut().zip(grad).zip(self.velocity.iter_mut()) {
            *v = mu * *v + g;
            *p -= lr * *v;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates() {
        let mut opt = GradientDescentWithMomentum::new(1, 1.0, 0.5);
        let mut params = [0.0];

        opt.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [-1.0]);

        // v = 0.5 * 1 + 1
        opt.update_params(&[1.0], &mut params).unwrap();
        assert_eq!(params, [-2.5]);
    }
}
