//! Dense row-major matrices
//!
//! The coordinator owns the full operands; workers only ever see a contiguous
//! block of rows of the left operand plus the whole right operand. Shapes are
//! always carried explicitly next to the data.

use rand::Rng;
use rayon::prelude::*;
use std::fmt;
use std::ops::Range;

/// Matrix construction and arithmetic errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatrixError {
    #[error("data length {len} does not match shape {rows}x{cols}")]
    LengthMismatch { rows: usize, cols: usize, len: usize },

    #[error("cannot multiply {a_rows}x{a_cols} by {b_rows}x{b_cols}")]
    ShapeMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    #[error("cannot stack a block with {got} columns onto {expected} columns")]
    ColumnMismatch { expected: usize, got: usize },
}

/// Dense matrix of 64-bit floats, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Create a matrix from row-major data
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, MatrixError> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(MatrixError::LengthMismatch {
                rows,
                cols,
                len: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Create a zero-filled matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create a matrix filled with values drawn uniformly from `[0, 1)`
    pub fn random(rows: usize, cols: usize) -> Self {
        let mut rng = rand::thread_rng();
        let data = (0..rows * cols).map(|_| rng.gen::<f64>()).collect();
        Self { rows, cols, data }
    }

    /// Create a matrix from nested rows (handy for small literals)
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, MatrixError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(MatrixError::ColumnMismatch {
                    expected: cols,
                    got: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(rows.len(), cols, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Borrow row `i`
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Borrow a contiguous block of rows as one flat row-major slice
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the row count.
    pub fn row_range(&self, rows: Range<usize>) -> &[f64] {
        &self.data[rows.start * self.cols..rows.end * self.cols]
    }

    /// Dense matrix product `self * other`
    ///
    /// Output rows are computed independently on the current rayon pool.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, MatrixError> {
        if self.cols != other.rows {
            return Err(MatrixError::ShapeMismatch {
                a_rows: self.rows,
                a_cols: self.cols,
                b_rows: other.rows,
                b_cols: other.cols,
            });
        }

        let n = other.cols;
        let mut out = vec![0.0; self.rows * n];
        if n == 0 {
            return Ok(Matrix::zeros(self.rows, 0));
        }

        out.par_chunks_mut(n).enumerate().for_each(|(i, out_row)| {
            let a_row = self.row(i);
            // i-k-j order keeps both inner accesses sequential
            for (k, &a_ik) in a_row.iter().enumerate() {
                let b_row = other.row(k);
                for (o, &b_kj) in out_row.iter_mut().zip(b_row) {
                    *o += a_ik * b_kj;
                }
            }
        });

        Ok(Matrix {
            rows: self.rows,
            cols: n,
            data: out,
        })
    }

    /// Concatenate row blocks vertically, in order
    pub fn vstack(cols: usize, blocks: &[Matrix]) -> Result<Matrix, MatrixError> {
        let rows = blocks.iter().map(Matrix::rows).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for block in blocks {
            if block.cols != cols && block.rows > 0 {
                return Err(MatrixError::ColumnMismatch {
                    expected: cols,
                    got: block.cols,
                });
            }
            data.extend_from_slice(&block.data);
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Overwrite a block of rows starting at `start_row`
    pub(crate) fn write_rows(&mut self, start_row: usize, block: &Matrix) -> Result<(), MatrixError> {
        if block.rows > 0 && block.cols != self.cols {
            return Err(MatrixError::ColumnMismatch {
                expected: self.cols,
                got: block.cols,
            });
        }
        let begin = start_row * self.cols;
        self.data[begin..begin + block.data.len()].copy_from_slice(&block.data);
        Ok(())
    }

    /// Fill a block of rows with a constant
    pub(crate) fn fill_rows(&mut self, rows: Range<usize>, value: f64) {
        let cols = self.cols;
        self.data[rows.start * cols..rows.end * cols].fill(value);
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} matrix", self.rows, self.cols)
    }
}
