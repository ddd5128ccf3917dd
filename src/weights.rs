//! Weight tensors and their per-variant topology.
//!
//! A [`WeightTensor`] is a stack of equally sized matrix slices (one per
//! channel, filter, or channel/filter pair) with the bookkeeping an external
//! optimizer and regularizer need: whether it is regulated, whether it is
//! trainable, and the fan-in/fan-out used to seed it.
//!
//! [`ConvolutionVariant::build`] decides which tensors a layer owns:
//!
//! | Variant               | Weights                              | Biases                        |
//! |-----------------------|--------------------------------------|-------------------------------|
//! | `Standard`            | `W`: depth x filters slices, `fr x fc` | `B`: filters slices, output map |
//! | `Depthwise`           | `WD`: depth slices, `fr x fc`        | `BD`: depth slices            |
//! | `Pointwise`           | `WP`: depth x filters slices, `1 x 1` | `BP`: filters slices          |
//! | `DepthwiseSeparable`  | `WD` then `WP`                       | `BD` then `BP`                |
//! | `Single`              | `W`: one slice, `fr x fc`            | `B`: one slice, output map    |
//!
//! Slices of channel/filter tensors are ordered `channel * filters + filter`.
//! A `Single` layer reads one channel and writes one, whatever the previous
//! depth and configured filter count.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{ConvError, Result};
use crate::geometry::{self, ChannelTopology, FilterGeometry, LayerDims};
use crate::matrix::Matrix;

/// Seeding function `(row, column, fan_in, fan_out) -> value`.
pub type SeedFn = dyn Fn(usize, usize, usize, usize) -> f64 + Send + Sync;

/// Strategy used to seed weight tensors.
#[derive(Clone, Default)]
pub enum Initialization {
    Zero,
    One,
    Constant(f64),
    #[default]
    UniformXavier,
    NormalXavier,
    UniformHe,
    NormalHe,
    UniformLeCun,
    NormalLeCun,
    Custom(Arc<SeedFn>),
}

impl fmt::Debug for Initialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("Zero"),
            Self::One => f.write_str("One"),
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::UniformXavier => f.write_str("UniformXavier"),
            Self::NormalXavier => f.write_str("NormalXavier"),
            Self::UniformHe => f.write_str("UniformHe"),
            Self::NormalHe => f.write_str("NormalHe"),
            Self::UniformLeCun => f.write_str("UniformLeCun"),
            Self::NormalLeCun => f.write_str("NormalLeCun"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Initialization {
    /// Wraps a custom seeding function.
    pub fn custom(f: impl Fn(usize, usize, usize, usize) -> f64 + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Draws the value for `(row, column)` of a tensor with the given fans.
    ///
    /// # Errors
    /// `Config` if a normal distribution cannot be built from the fans.
    pub fn sample<R: Rng>(
        &self,
        row: usize,
        column: usize,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<f64> {
        let fan_in_f = fan_in.max(1) as f64;
        let fan_sum = fan_in_f + fan_out.max(1) as f64;
        let uniform = |rng: &mut R, limit: f64| rng.random_range(-limit..=limit);
        let normal = |rng: &mut R, std: f64| -> Result<f64> {
            let dist = Normal::new(0.0, std).map_err(|e| ConvError::config(e.to_string()))?;
            Ok(dist.sample(rng))
        };
        Ok(match self {
            Self::Zero => 0.0,
            Self::One => 1.0,
            Self::Constant(v) => *v,
            Self::UniformXavier => uniform(rng, (6.0 / fan_sum).sqrt()),
            Self::NormalXavier => normal(rng, (2.0 / fan_sum).sqrt())?,
            Self::UniformHe => uniform(rng, (6.0 / fan_in_f).sqrt()),
            Self::NormalHe => normal(rng, (2.0 / fan_in_f).sqrt())?,
            Self::UniformLeCun => uniform(rng, (3.0 / fan_in_f).sqrt()),
            Self::NormalLeCun => normal(rng, (1.0 / fan_in_f).sqrt())?,
            Self::Custom(f) => f(row, column, fan_in, fan_out),
        })
    }
}

/// Whether a tensor holds weights or biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightRole {
    Weight,
    Bias,
}

/// A named stack of matrix slices.
#[derive(Debug, Clone)]
pub struct WeightTensor {
    name: String,
    role: WeightRole,
    slices: Vec<Matrix>,
    regulated: bool,
    trainable: bool,
    fan_in: usize,
    fan_out: usize,
}

impl WeightTensor {
    /// Creates `count` zero slices of `rows x columns`.
    pub fn new(
        name: impl Into<String>,
        role: WeightRole,
        count: usize,
        rows: usize,
        columns: usize,
        fan_in: usize,
        fan_out: usize,
    ) -> Self {
        let name = name.into();
        let slices = (0..count)
            .map(|i| Matrix::new(rows, columns).with_name(format!("{name}[{i}]")))
            .collect();
        Self {
            name,
            role,
            slices,
            regulated: false,
            trainable: true,
            fan_in,
            fan_out,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> WeightRole {
        self.role
    }

    pub fn slices(&self) -> &[Matrix] {
        &self.slices
    }

    /// Slices for an external optimizer to update in place.
    pub fn slices_mut(&mut self) -> &mut [Matrix] {
        &mut self.slices
    }

    pub fn slice(&self, index: usize) -> Option<&Matrix> {
        self.slices.get(index)
    }

    pub fn is_regulated(&self) -> bool {
        self.regulated
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Element count over all slices.
    pub fn parameter_count(&self) -> usize {
        self.slices.iter().map(Matrix::size).sum()
    }
}

/// Every tensor a layer owns, in registration order.
#[derive(Debug, Clone)]
pub struct WeightSet {
    tensors: Vec<WeightTensor>,
    initialization: Initialization,
    rng: StdRng,
}

impl WeightSet {
    /// Empty set seeding from `initialization` with a reproducible `seed`.
    pub fn new(initialization: Initialization, seed: u64) -> Self {
        Self {
            tensors: Vec::new(),
            initialization,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Adds a tensor. Biases are never regulated.
    pub fn register_weight(&mut self, mut tensor: WeightTensor, regulate: bool, trainable: bool) {
        tensor.regulated = regulate && tensor.role == WeightRole::Weight;
        tensor.trainable = trainable;
        self.tensors.push(tensor);
    }

    pub fn tensors(&self) -> &[WeightTensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WeightTensor> {
        self.tensors.iter_mut().find(|t| t.name == name)
    }

    pub(crate) fn require(&self, name: &str) -> Result<&WeightTensor> {
        self.get(name)
            .ok_or_else(|| ConvError::shape(format!("weight tensor {name} is not registered")))
    }

    pub fn initialization(&self) -> &Initialization {
        &self.initialization
    }

    /// Total element count of every registered tensor.
    pub fn number_of_parameters(&self) -> usize {
        self.tensors.iter().map(WeightTensor::parameter_count).sum()
    }

    /// Tensors included in regularization.
    pub fn regulated_weights(&self) -> impl Iterator<Item = &WeightTensor> {
        self.tensors.iter().filter(|t| t.regulated)
    }

    /// Tensors that receive gradient updates.
    pub fn trainable_weights(&self) -> impl Iterator<Item = &WeightTensor> {
        self.tensors.iter().filter(|t| t.trainable)
    }

    /// Re-seeds every weight tensor and zeroes every bias tensor.
    ///
    /// # Errors
    /// `Config` if the initialization cannot sample with a tensor's fans.
    pub fn reinitialize(&mut self) -> Result<()> {
        for tensor in &mut self.tensors {
            let (fan_in, fan_out) = (tensor.fan_in, tensor.fan_out);
            for slice in &mut tensor.slices {
                slice.unslice();
                if tensor.role == WeightRole::Bias {
                    slice.reset();
                    continue;
                }
                for r in 0..slice.rows() {
                    for c in 0..slice.columns() {
                        let value = self.initialization.sample(r, c, fan_in, fan_out, &mut self.rng)?;
                        slice.set(r, c, value);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Channel structure of a convolutional layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionVariant {
    Standard,
    Depthwise,
    Pointwise,
    DepthwiseSeparable,
    /// One filter over one channel.
    Single,
}

impl ConvolutionVariant {
    /// Output dimensions for `previous` input.
    ///
    /// # Errors
    /// `Dimension` as raised by [`geometry::resolve`].
    pub fn output_dims(self, previous: LayerDims, geometry: &FilterGeometry, filters: usize) -> Result<LayerDims> {
        match self {
            Self::Single => geometry::resolve(previous, geometry, 1, ChannelTopology::Single),
            Self::Standard => geometry::resolve(previous, geometry, filters, ChannelTopology::Full),
            Self::Depthwise => geometry::resolve(previous, geometry, filters, ChannelTopology::DepthSeparable),
            Self::Pointwise => geometry::resolve(previous, &FilterGeometry::unit(), filters, ChannelTopology::Full),
            Self::DepthwiseSeparable => {
                let spatial = self.depthwise_dims(previous, geometry)?;
                geometry::resolve(spatial, &FilterGeometry::unit(), filters, ChannelTopology::Full)
            }
        }
    }

    /// Dimensions the layer actually reads; `Single` collapses depth to one.
    pub fn input_dims(self, previous: LayerDims) -> LayerDims {
        match self {
            Self::Single => LayerDims { depth: 1, ..previous },
            _ => previous,
        }
    }

    fn depthwise_dims(self, previous: LayerDims, geometry: &FilterGeometry) -> Result<LayerDims> {
        geometry::resolve(previous, geometry, previous.depth, ChannelTopology::DepthSeparable)
    }

    /// Registers this variant's tensors into `weights` and returns the output
    /// dimensions.
    ///
    /// # Errors
    /// `Dimension` as raised by [`geometry::resolve`].
    pub fn build(
        self,
        previous: LayerDims,
        geometry: &FilterGeometry,
        filters: usize,
        regulate: bool,
        weights: &mut WeightSet,
    ) -> Result<LayerDims> {
        let output = self.output_dims(previous, geometry, filters)?;
        let previous = self.input_dims(previous);
        let (fr, fc) = (geometry.filter_rows(), geometry.filter_columns());
        let depth = previous.depth;

        let depthwise = |weights: &mut WeightSet, dims: LayerDims| {
            let taps = fr * fc;
            weights.register_weight(
                WeightTensor::new("WD", WeightRole::Weight, depth, fr, fc, taps, taps),
                regulate,
                true,
            );
            weights.register_weight(
                WeightTensor::new("BD", WeightRole::Bias, depth, dims.width, dims.height, taps, taps),
                false,
                true,
            );
        };
        let pointwise = |weights: &mut WeightSet, dims: LayerDims| {
            weights.register_weight(
                WeightTensor::new("WP", WeightRole::Weight, depth * filters, 1, 1, depth, filters),
                regulate,
                true,
            );
            weights.register_weight(
                WeightTensor::new("BP", WeightRole::Bias, filters, dims.width, dims.height, depth, filters),
                false,
                true,
            );
        };

        match self {
            Self::Standard | Self::Single => {
                let filters = output.depth;
                let (fan_in, fan_out) = (depth * fr * fc, filters * fr * fc);
                weights.register_weight(
                    WeightTensor::new("W", WeightRole::Weight, depth * filters, fr, fc, fan_in, fan_out),
                    regulate,
                    true,
                );
                weights.register_weight(
                    WeightTensor::new("B", WeightRole::Bias, filters, output.width, output.height, fan_in, fan_out),
                    false,
                    true,
                );
            }
            Self::Depthwise => depthwise(weights, output),
            Self::Pointwise => pointwise(weights, output),
            Self::DepthwiseSeparable => {
                depthwise(weights, self.depthwise_dims(previous, geometry)?);
                pointwise(weights, output);
            }
        }
        weights.reinitialize()?;
        Ok(output)
    }
}
