use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

/// Plain `p -= lr * g`.
#[derive(Debug)]
pub struct GradientDescent {
    lr: f32,
}

impl GradientDescent {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatchErr> {
        check_sizes(grad, params)?;

        params
            .iter_mut()
            .zip(grad)
            .for_each(|(p, g)| *p -= self.lr * g);

        Ok(())
    }
}
