//! Differentiable sliding-window operations without a graph.
//!
//! # Forward/Backward Pairs
//!
//! Each function runs one operator forward and hands back a closure that maps
//! the upstream gradient to the gradients of its operands:
//!
//! 1. **Inputs** are borrowed matrices and a [`FilterGeometry`].
//! 2. **Forward Pass** computes the output [`Matrix`].
//! 3. **Backward Pass** is a closure owning the operator and its trace.
//!
//! The closures implement `Fn` and can be called any number of times. They
//! borrow nothing from the operands, so the inputs may be dropped before the
//! backward pass runs. Use
//! [`crate::graph::ComputationGraph`] instead when several operations must be
//! chained and differentiated together.
//!
//! # Example
//! ```rust
//! use briny_conv::backprop::crosscorrelate;
//! use briny_conv::geometry::FilterGeometry;
//! use briny_conv::matrix;
//!
//! let input = matrix!([[1.0, 2.0], [3.0, 4.0]]);
//! let filter = matrix!([[1.0, 0.0], [0.0, 1.0]]);
//! let geometry = FilterGeometry::square(2).unwrap();
//!
//! let (out, back) = crosscorrelate(&input, &filter, geometry).unwrap();
//! assert_eq!(out.values(), vec![5.0]);
//!
//! let (d_input, d_filter) = back(&matrix!([[1.0]])).unwrap();
//! assert_eq!(d_input.values(), vec![1.0, 0.0, 0.0, 1.0]);
//! assert_eq!(d_filter.values(), vec![1.0, 2.0, 3.0, 4.0]);
//! ```

use crate::error::{ConvError, Result};
use crate::geometry::FilterGeometry;
use crate::graph::UnaryFunction;
use crate::matrix::Matrix;
use crate::ops::{
    AveragePool, Convolution, CrossCorrelation, CyclicPool, MaxPool, RandomPool, SlidingWindowOperator,
    WinogradConvolution,
};

fn filtered<O: SlidingWindowOperator>(
    operator: O,
    input: &Matrix,
    filter: &Matrix,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<(Matrix, Matrix)> + use<O>)> {
    let pass = operator.forward(input, Some(filter))?;
    let trace = pass.trace;
    Ok((pass.output, move |upstream: &Matrix| {
        let grads = operator.gradient(upstream, &trace)?;
        let d_filter = grads
            .filter
            .ok_or_else(|| ConvError::shape("filtered operator returned no filter gradient"))?;
        Ok((grads.input, d_filter))
    }))
}

fn pooled<O: SlidingWindowOperator>(
    operator: O,
    input: &Matrix,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<O>)> {
    let pass = operator.forward(input, None)?;
    let trace = pass.trace;
    Ok((pass.output, move |upstream: &Matrix| {
        Ok(operator.gradient(upstream, &trace)?.input)
    }))
}

/// Convolution with a flipped kernel.
///
/// # Returns
/// - `out`: the convolved matrix.
/// - `back`: closure mapping `dL/d(out)` to `(dL/d(input), dL/d(filter))`.
///
/// # Errors
/// `Dimension` if the geometry does not tile the input, `Shape` if the filter
/// does not match the geometry.
pub fn convolve(
    input: &Matrix,
    filter: &Matrix,
    geometry: FilterGeometry,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<(Matrix, Matrix)> + use<>)> {
    filtered(Convolution::new(geometry), input, filter)
}

/// Cross-correlation (no kernel flip).
///
/// # Errors
/// Same as [`convolve`].
pub fn crosscorrelate(
    input: &Matrix,
    filter: &Matrix,
    geometry: FilterGeometry,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<(Matrix, Matrix)> + use<>)> {
    filtered(CrossCorrelation::new(geometry), input, filter)
}

/// Winograd F(2x2, 3x3) convolution of `input` with a 3x3 `filter`.
///
/// # Errors
/// `Geometry` unless the filter is 3x3, `Dimension` if the input is smaller
/// than the filter.
pub fn winograd_convolve(
    input: &Matrix,
    filter: &Matrix,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<(Matrix, Matrix)> + use<>)> {
    let operator = WinogradConvolution::new(FilterGeometry::new(3, 3, 1, 1)?)?;
    filtered(operator, input, filter)
}

/// Max pooling; the backward closure routes each gradient to the window maximum.
///
/// # Errors
/// `Dimension` if the geometry does not tile the input.
pub fn max_pool(input: &Matrix, geometry: FilterGeometry) -> Result<(Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<>)> {
    pooled(MaxPool::new(geometry), input)
}

/// Average pooling; the backward closure spreads each gradient evenly.
///
/// # Errors
/// `Dimension` if the geometry does not tile the input.
pub fn average_pool(input: &Matrix, geometry: FilterGeometry) -> Result<(Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<>)> {
    pooled(AveragePool::new(geometry), input)
}

/// Cyclic pooling.
///
/// # Errors
/// `Dimension` if the geometry does not tile the input.
pub fn cyclic_pool(input: &Matrix, geometry: FilterGeometry) -> Result<(Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<>)> {
    pooled(CyclicPool::new(geometry), input)
}

/// Random pooling with a reproducible `seed`.
///
/// # Errors
/// `Dimension` if the geometry does not tile the input.
pub fn random_pool(
    input: &Matrix,
    geometry: FilterGeometry,
    seed: u64,
) -> Result<(Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<>)> {
    pooled(RandomPool::with_seed(geometry, seed), input)
}

/// Applies an elementwise function.
///
/// # Returns
/// - `out`: `function(input)` at unmasked positions.
/// - `back`: closure multiplying `dL/d(out)` by the derivative at `input`.
pub fn activate(input: &Matrix, function: UnaryFunction) -> (Matrix, impl Fn(&Matrix) -> Result<Matrix> + use<>) {
    let out = input.apply(function.function);
    let slope = input.apply(function.derivative);
    (out, move |upstream: &Matrix| upstream.multiply(&slope))
}
