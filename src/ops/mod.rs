//! # Sliding-Window Operators
//!
//! Every spatial operator of the engine implements [`SlidingWindowOperator`]:
//! a forward pass producing an output matrix together with a [`WindowTrace`],
//! and a gradient dual that consumes the upstream gradient and that trace.
//!
//! ## Submodules
//!
//! - [`convolution`]: convolution (flipped kernel) and cross-correlation
//! - [`winograd`]: fixed-geometry fast convolution, Winograd F(2x2, 3x3)
//! - [`pooling`]: max, average, cyclic and random pooling
//!
//! ## Window Addressing
//!
//! For output position `(r, c)` and tap `(i, j)` the input is read at
//!
//! ```text
//! (r * stride + i * dilation, c * stride + j * dilation)
//! ```
//!
//! over the active slice of the input. A tap is skipped when the input, or
//! the filter where there is one, masks it.
//!
//! ## Notes
//!
//! - Operators hold no per-call state and are safe to share across threads;
//!   random pooling keeps its generator behind a lock.
//! - Results are multiplied by the input's scaling constant, and gradients
//!   carry the same factor.
//! - Forward passes validate the stride/dilation invariant on the input the
//!   same way [`crate::geometry::resolve`] does for layer dimensions.

pub mod convolution;
pub mod pooling;
pub mod winograd;

use std::fmt;
use std::sync::Arc;

use crate::error::{ConvError, Result};
use crate::geometry::FilterGeometry;
use crate::matrix::Matrix;
use crate::matrix::mask::Mask;

pub use convolution::{Convolution, CrossCorrelation};
pub use pooling::{AveragePool, CyclicPool, MaxPool, RandomPool};
pub use winograd::WinogradConvolution;

/// Operator family, recorded in graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Convolution,
    Crosscorrelation,
    WinogradConvolution,
    MaxPool,
    AveragePool,
    CyclicPool,
    RandomPool,
}

/// Output of a forward pass.
#[derive(Debug, Clone)]
pub struct WindowPass {
    pub output: Matrix,
    pub trace: WindowTrace,
}

/// Gradients produced by a gradient dual.
#[derive(Debug, Clone)]
pub struct WindowGradient {
    /// Gradient with respect to the active slice of the input.
    pub input: Matrix,
    /// Gradient with respect to the filter, for filtered operators.
    pub filter: Option<Matrix>,
}

/// What a forward pass remembers for its gradient dual.
#[derive(Debug, Clone)]
pub enum WindowTrace {
    /// Dense copies of input and filter.
    Filtered { input: Matrix, filter: Matrix },
    /// Selected input position per output position, in row-major output order.
    Routed {
        rows: usize,
        columns: usize,
        scaling: f64,
        routes: Vec<Option<(usize, usize)>>,
    },
    /// Input extent and mask, enough to recompute each window's unmasked taps.
    Averaged {
        rows: usize,
        columns: usize,
        scaling: f64,
        mask: Option<Arc<Mask>>,
    },
}

/// A sliding-window operator with a hand-written gradient dual.
pub trait SlidingWindowOperator: Send + Sync + fmt::Debug {
    fn kind(&self) -> WindowKind;

    fn geometry(&self) -> FilterGeometry;

    /// Whether [`forward`](Self::forward) needs a filter operand.
    fn requires_filter(&self) -> bool {
        false
    }

    /// Slides the window over the active slice of `input`.
    ///
    /// # Errors
    /// `Dimension` if the geometry does not tile the input, `Shape` if the
    /// filter is missing, unexpected or of the wrong size.
    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass>;

    /// Maps `upstream` (shaped like the forward output) to input and filter
    /// gradients.
    ///
    /// # Errors
    /// `Shape` if `upstream` or `trace` do not belong to this operator.
    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient>;
}

/// Input position read by tap `(i, j)` of output `(r, c)`.
#[inline]
pub(crate) fn tap(geometry: &FilterGeometry, r: usize, c: usize, i: usize, j: usize) -> (usize, usize) {
    (
        r * geometry.stride() + i * geometry.dilation(),
        c * geometry.stride() + j * geometry.dilation(),
    )
}

pub(crate) fn check_upstream(upstream: &Matrix, rows: usize, columns: usize) -> Result<()> {
    if upstream.rows() != rows || upstream.columns() != columns {
        return Err(ConvError::shape(format!(
            "upstream gradient is {}x{}, expected {rows}x{columns}",
            upstream.rows(),
            upstream.columns()
        )));
    }
    Ok(())
}

pub(crate) fn trace_mismatch(kind: WindowKind) -> ConvError {
    ConvError::shape(format!("{kind:?} gradient received a trace of another operator"))
}
