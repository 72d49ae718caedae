use crate::{Result, WorkerErr};

/// The width of a sample row: `x_size` inputs followed by `y_size` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub x_size: usize,
    pub y_size: usize,
}

impl Shape {
    pub fn new(x_size: usize, y_size: usize) -> Self {
        Self { x_size, y_size }
    }

    /// The amount of `f32`s in one sample row.
    pub fn row(&self) -> usize {
        self.x_size + self.y_size
    }

    /// Whether either side of a row has no values.
    pub fn is_empty(&self) -> bool {
        self.x_size == 0 || self.y_size == 0
    }

    /// Amount of samples in `rows`, or an error if it isn't a whole number of rows.
    pub fn samples(&self, rows: &[f32]) -> Result<usize> {
        let row = self.row();

        if self.is_empty() || rows.len() % row != 0 {
            return Err(WorkerErr::SizeMismatch {
                what: "shard rows",
                got: rows.len(),
                expected: rows.len().next_multiple_of(row.max(1)),
            });
        }

        Ok(rows.len() / row)
    }

    /// Splits row-major samples into separate input and target buffers.
    pub fn split(&self, rows: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let n = self.samples(rows)?;
        let mut xs = Vec::with_capacity(n * self.x_size);
        let mut ys = Vec::with_capacity(n * self.y_size);

        for row in rows.chunks_exact(self.row()) {
            let (x, y) = row.split_at(self.x_size);
            xs.extend_from_slice(x);
            ys.extend_from_slice(y);
        }

        Ok((xs, ys))
    }
}

/// A differentiable model working on a flat parameter buffer.
///
/// Implementations must be pure functions of their arguments so every worker
/// computes the same values for the same parameters and samples.
pub trait Model: Send + Sync {
    /// The amount of parameters the model needs for `shape`.
    fn size(&self, shape: Shape) -> usize;

    /// Computes the outputs for the inputs `xs`, writing `n * y_size` values into `out`.
    fn forward(&self, shape: Shape, params: &[f32], xs: &[f32], out: &mut [f32]) -> Result<()>;

    /// Computes the parameters' gradient given the gradient of the loss w.r.t. the outputs.
    ///
    /// `grad` is overwritten, not accumulated into.
    fn backward(
        &self,
        shape: Shape,
        params: &[f32],
        xs: &[f32],
        d_out: &[f32],
        grad: &mut [f32],
    ) -> Result<()>;
}

/// A loss function over a shard's outputs and targets.
pub trait Criterion: Send + Sync {
    /// The mean loss over the samples.
    fn loss(&self, out: &[f32], ys: &[f32]) -> Result<f64>;

    /// The gradient of `loss` w.r.t. `out`.
    fn grad(&self, out: &[f32], ys: &[f32], d_out: &mut [f32]) -> Result<()>;
}

fn check_shape(shape: Shape) -> Result<()> {
    if shape.is_empty() {
        return Err(WorkerErr::SizeMismatch {
            what: "sample shape",
            got: 0,
            expected: 1,
        });
    }

    Ok(())
}

fn check_len(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(WorkerErr::SizeMismatch {
            what,
            got,
            expected,
        });
    }

    Ok(())
}

/// A dense affine map `y = W·x + b`.
///
/// Parameters are laid out as `W` row-major (`y_size × x_size`) followed by `b`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Linear;

impl Model for Linear {
    fn size(&self, shape: Shape) -> usize {
        shape.y_size * shape.x_size + shape.y_size
    }

    fn forward(&self, shape: Shape, params: &[f32], xs: &[f32], out: &mut [f32]) -> Result<()> {
        let Shape { x_size, y_size } = shape;
        check_shape(shape)?;
        check_len("params", params.len(), self.size(shape))?;

        let n = xs.len() / x_size.max(1);
        check_len("outputs", out.len(), n * y_size)?;

        let (w, b) = params.split_at(y_size * x_size);

        for (x, o) in xs.chunks_exact(x_size).zip(out.chunks_exact_mut(y_size)) {
            for (j, o) in o.iter_mut().enumerate() {
                let row = &w[j * x_size..(j + 1) * x_size];
                *o = row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + b[j];
            }
        }

        Ok(())
    }

    fn backward(
        &self,
        shape: Shape,
        params: &[f32],
        xs: &[f32],
        d_out: &[f32],
        grad: &mut [f32],
    ) -> Result<()> {
        let Shape { x_size, y_size } = shape;
        check_shape(shape)?;
        check_len("params", params.len(), self.size(shape))?;
        check_len("gradient", grad.len(), params.len())?;

        grad.fill(0.0);
        let (gw, gb) = grad.split_at_mut(y_size * x_size);

        for (x, d) in xs.chunks_exact(x_size).zip(d_out.chunks_exact(y_size)) {
            for (j, d) in d.iter().enumerate() {
                gw[j * x_size..(j + 1) * x_size]
                    .iter_mut()
                    .zip(x)
                    .for_each(|(g, x)| *g += d * x);
                gb[j] += d;
            }
        }

        Ok(())
    }
}

/// Mean squared error, averaged over every output of every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Criterion for Mse {
    fn loss(&self, out: &[f32], ys: &[f32]) -> Result<f64> {
        check_len("targets", ys.len(), out.len())?;

        if out.is_empty() {
            return Ok(0.0);
        }

        let sum: f64 = out
            .iter()
            .zip(ys)
            .map(|(o, y)| {
                let diff = (*o - *y) as f64;
                diff * diff
            })
            .sum();

        Ok(sum / out.len() as f64)
    }

    fn grad(&self, out: &[f32], ys: &[f32], d_out: &mut [f32]) -> Result<()> {
        check_len("targets", ys.len(), out.len())?;
        check_len("output gradient", d_out.len(), out.len())?;

        let scale = 2.0 / out.len().max(1) as f32;

        for ((d, o), y) in d_out.iter_mut().zip(out).zip(ys) {
            *d = scale * (o - y);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_forward_is_affine() {
        let shape = Shape::new(2, 1);
        // w = [2, 3], b = [1]
        let params = [2.0, 3.0, 1.0];
        let xs = [1.0, 1.0, 0.0, 2.0];
        let mut out = [0.0; 2];

        Linear.forward(shape, &params, &xs, &mut out).unwrap();
        assert_eq!(out, [6.0, 7.0]);
    }

    #[test]
    fn linear_backward_matches_hand_derivation() {
        let shape = Shape::new(1, 1);
        let params = [0.0, 0.0];
        let xs = [1.0, 2.0];
        let d_out = [1.0, -1.0];
        let mut grad = [9.0; 2];

        Linear
            .backward(shape, &params, &xs, &d_out, &mut grad)
            .unwrap();
        assert_eq!(grad, [1.0 - 2.0, 0.0]);
    }

    #[test]
    fn mse_loss_and_gradient() {
        let out = [1.0, 3.0];
        let ys = [0.0, 1.0];

        assert_eq!(Mse.loss(&out, &ys).unwrap(), 2.5);

        let mut d = [0.0; 2];
        Mse.grad(&out, &ys, &mut d).unwrap();
        assert_eq!(d, [1.0, 2.0]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let shape = Shape::new(2, 1);
        assert!(shape.samples(&[1.0; 7]).is_err());
        assert_eq!(shape.samples(&[1.0; 9]).unwrap(), 3);
    }

    #[test]
    fn split_separates_inputs_and_targets() {
        let shape = Shape::new(2, 1);
        let (xs, ys) = shape.split(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(xs, [1.0, 2.0, 4.0, 5.0]);
        assert_eq!(ys, [3.0, 6.0]);
    }
}
