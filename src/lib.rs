//! briny_conv: convolution and pooling engine with masking and autodiff.
//!
//! Turns a declarative spatial-layer configuration into validated output
//! dimensions, a per-variant topology of weight tensors, and sliding-window
//! operators with hand-written gradient duals, all over one dense matrix type
//! that supports element/row/column masking.
//!
//! # Features
//!
//! - Dense [`matrix::Matrix`] with slice windows, transposition, scaling and
//!   stackable masks whose excluded positions every operation skips.
//! - Exact dimension algebra for filter size, stride and dilation
//!   ([`geometry`]), failing fast instead of producing a wrong extent.
//! - Convolution, cross-correlation, Winograd F(2x2, 3x3) and max, average,
//!   cyclic and random pooling ([`ops`]), each forward/backward consistent.
//! - Standard, depthwise, pointwise and depthwise-separable weight topologies
//!   ([`weights`]).
//! - An explicit recording [`graph::ComputationGraph`] with reverse-mode replay.
//!
//! # Modules
//!
//! - [`matrix`]: Matrix, masks and elementwise/product operations.
//! - [`geometry`]: Filter geometry and output-dimension resolution.
//! - [`ops`]: Sliding-window operators and their gradient duals.
//! - [`backprop`]: Forward/backward closures without a graph.
//! - [`graph`]: Computation graph recorder.
//! - [`weights`]: Weight tensors, initialization and variant topology.
//! - [`layer`]: Typed configuration and layer adapters.
//! - [`batch`]: Lock-guarded sample container.
//! - [`approx`]: Graded floating point comparison.
//! - [`error`]: The crate-wide error type.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::backprop::max_pool;
//! use briny_conv::geometry::FilterGeometry;
//! use briny_conv::matrix;
//!
//! let input = matrix!([[1.0, 5.0], [3.0, 2.0]]);
//! let (out, back) = max_pool(&input, FilterGeometry::square(2).unwrap()).unwrap();
//! assert_eq!(out.values(), vec![5.0]);
//! assert_eq!(back(&matrix!([[1.0]])).unwrap().values(), vec![0.0, 1.0, 0.0, 0.0]);
//! ```

pub mod approx;
pub mod backprop;
pub mod batch;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod layer;
pub mod matrix;
pub mod ops;
pub mod weights;

pub use error::{ConvError, Result};
