//! Elementwise, product and reduction operations on [`Matrix`].
//!
//! Every operation reads the active slice of its operands, skips masked
//! positions, and multiplies its results by the left operand's scaling
//! constant. Results are fresh untagged matrices.

use std::sync::Arc;

use rayon::prelude::*;

use super::Matrix;
use crate::error::{ConvError, Result};

impl Matrix {
    /// Applies `f` to every unmasked element.
    ///
    /// The result inherits the mask of the active slice; masked positions
    /// stay zero.
    pub fn apply(&self, f: impl Fn(f64) -> f64) -> Matrix {
        let mut out = self.zeros_like();
        for r in 0..self.rows() {
            for c in 0..self.columns() {
                if !self.is_masked(r, c) {
                    out.set(r, c, self.scaling * f(self.get(r, c)));
                }
            }
        }
        out.mask = self.cropped_mask();
        out
    }

    /// Combines two equally sized matrices elementwise with `f`.
    ///
    /// A position masked in either operand is skipped, and the result carries
    /// the union of both masks.
    ///
    /// # Errors
    /// `Shape` if the active slices differ in size.
    pub fn apply_bi(&self, other: &Matrix, f: impl Fn(f64, f64) -> f64) -> Result<Matrix> {
        self.ensure_equal_size(other, "elementwise operation")?;
        let mut out = self.zeros_like();
        for r in 0..self.rows() {
            for c in 0..self.columns() {
                if !self.is_masked(r, c) && !other.is_masked(r, c) {
                    out.set(r, c, self.scaling * f(self.get(r, c), other.get(r, c)));
                }
            }
        }
        out.mask = match (self.cropped_mask(), other.cropped_mask()) {
            (Some(a), Some(b)) => Some(Arc::new(a.union(&b)?)),
            (a, b) => a.or(b),
        };
        Ok(out)
    }

    /// Elementwise sum.
    ///
    /// # Errors
    /// `Shape` on size mismatch.
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.apply_bi(other, |a, b| a + b)
    }

    /// Elementwise difference.
    ///
    /// # Errors
    /// `Shape` on size mismatch.
    pub fn subtract(&self, other: &Matrix) -> Result<Matrix> {
        self.apply_bi(other, |a, b| a - b)
    }

    /// Elementwise (Hadamard) product.
    ///
    /// # Errors
    /// `Shape` on size mismatch.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix> {
        self.apply_bi(other, |a, b| a * b)
    }

    /// Elementwise quotient.
    ///
    /// # Errors
    /// `Shape` on size mismatch.
    pub fn divide(&self, other: &Matrix) -> Result<Matrix> {
        self.apply_bi(other, |a, b| a / b)
    }

    /// Adds `constant` to every unmasked element.
    pub fn add_constant(&self, constant: f64) -> Matrix {
        self.apply(|x| x + constant)
    }

    /// Multiplies every unmasked element by `constant`.
    pub fn multiply_constant(&self, constant: f64) -> Matrix {
        self.apply(|x| x * constant)
    }

    /// Matrix product `self (m x k) . other (k x n)`.
    ///
    /// Terms whose left or right factor is masked are skipped. Rows of the
    /// result are computed in parallel.
    ///
    /// # Errors
    /// `Shape` if the inner dimensions disagree.
    pub fn dot(&self, other: &Matrix) -> Result<Matrix> {
        let (m, k, n) = (self.rows(), self.columns(), other.columns());
        if k != other.rows() {
            return Err(ConvError::shape(format!(
                "dot product of {m}x{k} and {}x{n} matrices",
                other.rows()
            )));
        }

        let mut data = vec![0.0; m * n];
        if n > 0 {
            data.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
                for (j, slot) in row.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for l in 0..k {
                        if !self.is_masked(i, l) && !other.is_masked(l, j) {
                            sum += self.get(i, l) * other.get(l, j);
                        }
                    }
                    *slot = self.scaling * sum;
                }
            });
        }
        Matrix::from_vec(m, n, data)
    }

    /// Sum of unmasked elements.
    pub fn sum(&self) -> f64 {
        self.unmasked().map(|(_, _, v)| v).sum()
    }

    /// Number of unmasked elements in the active slice.
    pub fn count_unmasked(&self) -> usize {
        self.unmasked().count()
    }

    /// Mean of unmasked elements, `0` when everything is masked.
    pub fn mean(&self) -> f64 {
        let n = self.count_unmasked();
        if n == 0 { 0.0 } else { self.sum() / n as f64 }
    }

    /// Population variance of unmasked elements, `0` when everything is masked.
    pub fn variance(&self) -> f64 {
        let n = self.count_unmasked();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        self.unmasked().map(|(_, _, v)| (v - mean).powi(2)).sum::<f64>() / n as f64
    }

    /// Largest unmasked element and its position; ties keep the first in
    /// row-major order.
    pub fn max(&self) -> Option<(f64, usize, usize)> {
        self.unmasked().fold(None, |best, (r, c, v)| match best {
            Some((b, _, _)) if v <= b => best,
            _ => Some((v, r, c)),
        })
    }

    /// Smallest unmasked element and its position; ties keep the first in
    /// row-major order.
    pub fn min(&self) -> Option<(f64, usize, usize)> {
        self.unmasked().fold(None, |best, (r, c, v)| match best {
            Some((b, _, _)) if v >= b => best,
            _ => Some((v, r, c)),
        })
    }

    fn unmasked(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.rows()).flat_map(move |r| {
            (0..self.columns())
                .filter(move |&c| !self.is_masked(r, c))
                .map(move |c| (r, c, self.get(r, c)))
        })
    }
}
