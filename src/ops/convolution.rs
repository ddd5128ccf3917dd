//! Convolution and cross-correlation.
//!
//! Both slide a filter over the input and multiply-accumulate. They differ
//! only in how the filter is addressed:
//!
//! - cross-correlation reads `filter(i, j)`,
//! - convolution reads `filter(rows - 1 - i, columns - 1 - j)` (flipped kernel).
//!
//! The gradient duals keep the same addressing, so
//! `crosscorrelate(x, w) == convolve(x, flip(w))` holds both forward and
//! backward.

use super::{
    SlidingWindowOperator, WindowGradient, WindowKind, WindowPass, WindowTrace, check_upstream, tap,
    trace_mismatch,
};
use crate::error::{ConvError, Result};
use crate::geometry::FilterGeometry;
use crate::matrix::Matrix;

/// Convolution with a 180 degree flipped kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convolution {
    geometry: FilterGeometry,
}

impl Convolution {
    pub fn new(geometry: FilterGeometry) -> Self {
        Self { geometry }
    }
}

/// Sliding multiply-accumulate without kernel flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossCorrelation {
    geometry: FilterGeometry,
}

impl CrossCorrelation {
    pub fn new(geometry: FilterGeometry) -> Self {
        Self { geometry }
    }
}

impl SlidingWindowOperator for Convolution {
    fn kind(&self) -> WindowKind {
        WindowKind::Convolution
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn requires_filter(&self) -> bool {
        true
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        filtered_forward(&self.geometry, input, filter, true)
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

impl SlidingWindowOperator for CrossCorrelation {
    fn kind(&self) -> WindowKind {
        WindowKind::Crosscorrelation
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn requires_filter(&self) -> bool {
        true
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        filtered_forward(&self.geometry, input, filter, false)
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        match trace {
            WindowTrace::Filtered { input, filter } => {
                filtered_gradient(&self.geometry, upstream, input, filter, false)
            }
            _ => Err(trace_mismatch(self.kind())),
        }
    }
}

/// Returns the filter, checking that it matches the geometry.
pub(crate) fn require_filter<'a>(geometry: &FilterGeometry, filter: Option<&'a Matrix>) -> Result<&'a Matrix> {
    let filter = filter.ok_or_else(|| ConvError::shape("filtered operator called without a filter"))?;
    if filter.rows() != geometry.filter_rows() || filter.columns() != geometry.filter_columns() {
        return Err(ConvError::shape(format!(
            "{}x{} filter does not match {}x{} geometry",
            filter.rows(),
            filter.columns(),
            geometry.filter_rows(),
            geometry.filter_columns()
        )));
    }
    Ok(filter)
}

#[inline]
fn filter_index(geometry: &FilterGeometry, i: usize, j: usize, flipped: bool) -> (usize, usize) {
    if flipped {
        (geometry.filter_rows() - 1 - i, geometry.filter_columns() - 1 - j)
    } else {
        (i, j)
    }
}

/// Direct sliding multiply-accumulate shared by both conventions.
pub(crate) fn filtered_forward(
    geometry: &FilterGeometry,
    input: &Matrix,
    filter: Option<&Matrix>,
    flipped: bool,
) -> Result<WindowPass> {
    let filter = require_filter(geometry, filter)?;
    let (rows, columns) = geometry.output_size(input.rows(), input.columns())?;
    let (stride, dilation) = (geometry.stride(), geometry.dilation());

    let mut output = Matrix::new(rows, columns);
    for r in 0..rows {
        for c in 0..columns {
            let window = input.window(
                r * stride,
                c * stride,
                geometry.effective_rows(),
                geometry.effective_columns(),
            )?;
            let mut sum = 0.0;
            for i in 0..geometry.filter_rows() {
                for j in 0..geometry.filter_columns() {
                    let (wr, wc) = (i * dilation, j * dilation);
                    let (fr, fc) = filter_index(geometry, i, j, flipped);
                    if window.is_masked(wr, wc) || filter.is_masked(fr, fc) {
                        continue;
                    }
                    sum += window.get(wr, wc) * filter.get(fr, fc);
                }
            }
            output.set(r, c, input.scaling() * sum);
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

/// Input and filter gradients of [`filtered_forward`].
pub(crate) fn filtered_gradient(
    geometry: &FilterGeometry,
    upstream: &Matrix,
    input: &Matrix,
    filter: &Matrix,
    flipped: bool,
) -> Result<WindowGradient> {
    let (rows, columns) = geometry.output_size(input.rows(), input.columns())?;
    check_upstream(upstream, rows, columns)?;
    let k = input.scaling();

    let mut d_input = input.zeros_like();
    let mut d_filter = filter.zeros_like();
    for r in 0..rows {
        for c in 0..columns {
            if upstream.is_masked(r, c) {
                continue;
            }
            let g = k * upstream.get(r, c);
            for i in 0..geometry.filter_rows() {
                for j in 0..geometry.filter_columns() {
                    let (ir, ic) = tap(geometry, r, c, i, j);
                    let (fr, fc) = filter_index(geometry, i, j, flipped);
                    if input.is_masked(ir, ic) || filter.is_masked(fr, fc) {
                        continue;
                    }
                    d_input.increment(ir, ic, g * filter.get(fr, fc));
                    d_filter.increment(fr, fc, g * input.get(ir, ic));
                }
            }
        }
    }

    Ok(WindowGradient {
        input: d_input,
        filter: Some(d_filter),
    })
}
