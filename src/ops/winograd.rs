//! Winograd F(2x2, 3x3) convolution.
//!
//! Each 4x4 input tile yields a 2x2 output tile with 16 multiplications instead
//! of 36:
//!
//! ```text
//! U = G g G^T          (4x4, filter transform, once per call)
//! V = B^T d B          (4x4, input tile transform)
//! Y = A^T (U . V) A    (2x2, output tile)
//! ```
//!
//! The transform computes a cross-correlation; convolution is obtained by
//! flipping `g` first. Tiles advance by two, and an odd output extent is
//! covered by zero-extending the last tile.
//!
//! Only 3x3 filters with stride and dilation 1 are accepted. Masked operands
//! are routed through the direct convolution since the transform cannot skip
//! individual taps.

use log::warn;

use super::convolution::{filtered_forward, filtered_gradient, require_filter};
use super::{SlidingWindowOperator, WindowGradient, WindowKind, WindowPass, WindowTrace, trace_mismatch};
use crate::error::{ConvError, Result};
use crate::geometry::FilterGeometry;
use crate::matrix::Matrix;

const B_T: [[f64; 4]; 4] = [
    [1.0, 0.0, -1.0, 0.0],
    [0.0, 1.0, 1.0, 0.0],
    [0.0, -1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0, -1.0],
];

const G: [[f64; 3]; 4] = [
    [1.0, 0.0, 0.0],
    [0.5, 0.5, 0.5],
    [0.5, -0.5, 0.5],
    [0.0, 0.0, 1.0],
];

const A_T: [[f64; 4]; 2] = [[1.0, 1.0, 1.0, 0.0], [0.0, 1.0, -1.0, -1.0]];

/// Fast 3x3 convolution, equivalent to [`super::Convolution`] on that geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinogradConvolution {
    geometry: FilterGeometry,
}

impl WinogradConvolution {
    /// # Errors
    /// `Geometry` unless the filter is 3x3 with stride 1 and dilation 1.
    pub fn new(geometry: FilterGeometry) -> Result<Self> {
        if geometry.filter_rows() != 3
            || geometry.filter_columns() != 3
            || geometry.dilation() != 1
            || geometry.stride() != 1
        {
            return Err(ConvError::geometry(format!(
                "fast convolution needs a 3x3 filter with stride 1 and dilation 1, got {}x{} stride {} dilation {}",
                geometry.filter_rows(),
                geometry.filter_columns(),
                geometry.stride(),
                geometry.dilation()
            )));
        }
        Ok(Self { geometry })
    }
}

impl SlidingWindowOperator for WinogradConvolution {
    fn kind(&self) -> WindowKind {
        WindowKind::WinogradConvolution
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn requires_filter(&self) -> bool {
        true
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        let filter = match require_filter(&self.geometry, filter) {
            Ok(f) => f,
            Err(ConvError::Shape(msg)) if filter.is_some() => return Err(ConvError::geometry(msg)),
            Err(e) => return Err(e),
        };
        if input.has_mask() || filter.has_mask() {
            warn!("masked operand, fast convolution falls back to the direct path");
            return filtered_forward(&self.geometry, input, Some(filter), true);
        }

        let (rows, columns) = self.geometry.output_size(input.rows(), input.columns())?;
        let mut g = [[0.0; 3]; 3];
        for (i, row) in g.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = filter.get(2 - i, 2 - j);
            }
        }
        let u = product(&product(&G, &g), &transpose(&G));

        let mut output = Matrix::new(rows, columns);
        for tr in (0..rows).step_by(2) {
            for tc in (0..columns).step_by(2) {
                let mut d = [[0.0; 4]; 4];
                for (a, row) in d.iter_mut().enumerate() {
                    for (b, v) in row.iter_mut().enumerate() {
                        let (ir, ic) = (tr + a, tc + b);
                        if ir < input.rows() && ic < input.columns() {
                            *v = input.get(ir, ic);
                        }
                    }
                }
                let v = product(&product(&B_T, &d), &transpose(&B_T));
                let mut m = [[0.0; 4]; 4];
                for a in 0..4 {
                    for b in 0..4 {
                        m[a][b] = u[a][b] * v[a][b];
                    }
                }
                let y = product(&product(&A_T, &m), &transpose(&A_T));
                for (a, row) in y.iter().enumerate() {
                    for (b, &value) in row.iter().enumerate() {
                        if tr + a < rows && tc + b < columns {
                            output.set(tr + a, tc + b, input.scaling() * value);
                        }
                    }
                }
            }
        }

        Ok(WindowPass {
            output,
            trace: WindowTrace::Filtered {
                input: input.to_dense(),
                filter: filter.to_dense(),
            },
        })
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        match trace {
            WindowTrace::Filtered { input, filter } => {
                filtered_gradient(&self.geometry, upstream, input, filter, true)
            }
            _ => Err(trace_mismatch(self.kind())),
        }
    }
}

fn product<const M: usize, const K: usize, const N: usize>(
    a: &[[f64; K]; M],
    b: &[[f64; N]; K],
) -> [[f64; N]; M] {
    let mut out = [[0.0; N]; M];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..K).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn transpose<const M: usize, const N: usize>(a: &[[f64; N]; M]) -> [[f64; M]; N] {
    let mut out = [[0.0; M]; N];
    for (i, row) in a.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            out[j][i] = v;
        }
    }
    out
}
