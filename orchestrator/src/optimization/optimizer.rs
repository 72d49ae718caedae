use std::{error::Error, fmt};

/// A gradient and the parameters it updates have different lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatchErr {
    pub got: usize,
    pub expected: usize,
}

impl fmt::Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gradient of {} values for {} parameters",
            self.got, self.expected
        )
    }
}

impl Error for SizeMismatchErr {}

pub(super) fn check_sizes(grad: &[f32], params: &[f32]) -> Result<(), SizeMismatchErr> {
    if grad.len() != params.len() {
        return Err(SizeMismatchErr {
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}

/// Defines how a chunk of parameters moves along its gradient.
pub trait Optimizer {
    /// Updates `params` in place with `grad`.
    ///
    /// # Arguments
    /// * `grad` - The averaged gradient of the chunk.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if `grad` and `params` have different lengths.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatchErr>;
}
