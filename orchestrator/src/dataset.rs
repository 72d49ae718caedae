use std::ops::Range;

use worker::Shape;

use crate::{error::SerializationError, partition::ShardAssignment};

/// Row-major training samples, every row holds `x_size` inputs followed by `y_size` targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    data: Vec<f32>,
    x_size: usize,
    y_size: usize,
}

impl Batch {
    /// Creates a new `Batch`.
    ///
    /// # Returns
    /// A `SerializationError` if `data` isn't a whole number of rows.
    pub fn new(data: Vec<f32>, x_size: usize, y_size: usize) -> Result<Self, SerializationError> {
        if x_size == 0 || y_size == 0 {
            return Err(SerializationError::EmptyRow { x_size, y_size });
        }

        let row = x_size + y_size;
        if data.len() % row != 0 {
            return Err(SerializationError::RaggedRows {
                len: data.len(),
                row,
            });
        }

        Ok(Self {
            data,
            x_size,
            y_size,
        })
    }

    /// Amount of samples.
    pub fn len(&self) -> usize {
        self.data.len() / self.row()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn x_size(&self) -> usize {
        self.x_size
    }

    pub fn y_size(&self) -> usize {
        self.y_size
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.x_size, self.y_size)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Only the inputs of every row, without the targets.
    pub fn inputs(&self) -> Vec<f32> {
        self.data
            .chunks_exact(self.row())
            .flat_map(|row| &row[..self.x_size])
            .copied()
            .collect()
    }

    /// The samples in `range`.
    pub fn rows(&self, range: Range<usize>) -> &[f32] {
        let row = self.row();
        &self.data[range.start * row..range.end * row]
    }

    /// Copies out the rows assigned to a worker.
    pub fn shard(&self, assignment: &ShardAssignment) -> Shard {
        Shard {
            owner: assignment.owner.clone(),
            sample_range: assignment.sample_range.clone(),
            payload: self.rows(assignment.sample_range.clone()).to_vec(),
        }
    }

    /// Splits the batch in consecutive batches of `size` samples, the last one may be shorter.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = Batch> + '_ {
        self.data
            .chunks(size.max(1) * self.row())
            .map(|data| Batch {
                data: data.to_vec(),
                x_size: self.x_size,
                y_size: self.y_size,
            })
    }

    fn row(&self) -> usize {
        self.x_size + self.y_size
    }
}

/// A contiguous slice of one batch, assigned to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub owner: String,
    pub sample_range: Range<usize>,
    pub payload: Vec<f32>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.sample_range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_range.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch::new(vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0], 1, 1).unwrap()
    }

    #[test]
    fn ragged_data_is_rejected() {
        assert_eq!(
            Batch::new(vec![1.0; 5], 2, 1),
            Err(SerializationError::RaggedRows { len: 5, row: 3 })
        );
    }

    #[test]
    fn shard_copies_its_rows() {
        let assignment = ShardAssignment {
            owner: "w".into(),
            sample_range: 1..3,
        };

        let shard = batch().shard(&assignment);
        assert_eq!(shard.payload, [2.0, 20.0, 3.0, 30.0]);
        assert_eq!(shard.len(), 2);
    }

    #[test]
    fn chunks_keep_the_tail() {
        let sizes: Vec<usize> = batch().chunks(2).map(|b| b.len()).collect();
        assert_eq!(sizes, [2, 1]);
    }

    #[test]
    fn inputs_drop_targets() {
        assert_eq!(batch().inputs(), [1.0, 2.0, 3.0]);
    }
}
