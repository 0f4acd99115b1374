pub mod aggregate;
pub mod codec;

use std::collections::BTreeMap;

use thiserror::Error;

pub use aggregate::{TimeWindow, aggregate_files, aggregate_window, sum_matrices};

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix sizes differ: {left} vs {right}")]
    SizeMismatch { left: usize, right: usize },
    #[error("entry ({row}, {col}) is outside a {size}x{size} matrix")]
    OutOfBounds { row: usize, col: usize, size: usize },
    #[error("matrix is not square: row {row} has {len} columns, expected {size}")]
    NotSquare { row: usize, len: usize, size: usize },
    #[error("matrix source `{path}` not found")]
    MissingSource { path: String },
    #[error("matrix source `{path}` is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("count at ({row}, {col}) overflows")]
    CountOverflow { row: usize, col: usize },
    #[error("time step must be positive")]
    InvalidStep,
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Square sparse count matrix of observed handovers, indexed by airspace
/// ordinal. Zero counts are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionMatrix {
    size: usize,
    entries: BTreeMap<(usize, usize), u64>,
}

impl TransitionMatrix {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: BTreeMap::new(),
        }
    }

    pub fn from_dense(rows: &[Vec<u64>]) -> Result<Self, MatrixError> {
        let size = rows.len();
        let mut matrix = Self::new(size);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != size {
                return Err(MatrixError::NotSquare {
                    row: i,
                    len: row.len(),
                    size,
                });
            }
            for (j, count) in row.iter().enumerate() {
                matrix.add(i, j, *count)?;
            }
        }
        Ok(matrix)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn is_zero(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> u64 {
        self.entries.get(&(row, col)).copied().unwrap_or(0)
    }

    pub fn add(&mut self, row: usize, col: usize, count: u64) -> Result<(), MatrixError> {
        if row >= self.size || col >= self.size {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                size: self.size,
            });
        }
        if count == 0 {
            return Ok(());
        }
        let sum = self
            .get(row, col)
            .checked_add(count)
            .ok_or(MatrixError::CountOverflow { row, col })?;
        self.entries.insert((row, col), sum);
        Ok(())
    }

    /// Row-major iteration over the nonzero entries.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, u64)> + '_ {
        self.entries
            .iter()
            .map(|(&(row, col), &count)| (row, col, count))
    }

    /// Element-wise addition. On overflow `self` is left unchanged.
    pub fn merge(&mut self, other: &TransitionMatrix) -> Result<(), MatrixError> {
        if self.size != other.size {
            return Err(MatrixError::SizeMismatch {
                left: self.size,
                right: other.size,
            });
        }
        let sums = other
            .entries()
            .map(|(row, col, count)| {
                self.get(row, col)
                    .checked_add(count)
                    .map(|sum| ((row, col), sum))
                    .ok_or(MatrixError::CountOverflow { row, col })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.entries.extend(sums);
        Ok(())
    }

    pub fn scaled(&self, factor: u64) -> Result<Self, MatrixError> {
        let entries = if factor == 0 {
            BTreeMap::new()
        } else {
            self.entries
                .iter()
                .map(|(&(row, col), &count)| {
                    count
                        .checked_mul(factor)
                        .map(|scaled| ((row, col), scaled))
                        .ok_or(MatrixError::CountOverflow { row, col })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?
        };
        Ok(Self {
            size: self.size,
            entries,
        })
    }

    /// Sum of all counts, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        self.entries
            .values()
            .fold(0u64, |acc, &count| acc.saturating_add(count))
    }
}
