//! Configuration and the thin layer adapters built on the operators.
//!
//! A layer resolves its dimensions and allocates its weights once, in its
//! constructor; a malformed configuration never reaches a forward pass.
//! Forward passes are issued through a [`ComputationGraph`], so the whole layer
//! can be differentiated with [`ComputationGraph::backward`].
//!
//! # Example
//! ```rust
//! use briny_conv::geometry::LayerDims;
//! use briny_conv::layer::{ConvolutionKind, ConvolutionalLayer, Layer, LayerConfig};
//! use briny_conv::matrix::Matrix;
//! use briny_conv::weights::Initialization;
//!
//! let config = LayerConfig::from_json(r#"{"filters": 2, "filterSize": 3}"#).unwrap();
//! let layer = ConvolutionalLayer::from_config(
//!     config,
//!     LayerDims::new(5, 5, 1),
//!     ConvolutionKind::Crosscorrelation,
//!     Initialization::UniformHe,
//!     7,
//! )
//! .unwrap();
//!
//! let out = layer.infer(&[Matrix::constant(5, 5, 1.0)]).unwrap();
//! assert_eq!(out.len(), 2);
//! assert_eq!((out[0].rows(), out[0].columns()), (3, 3));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use briny::prelude::{TrustedData, Validate, ValidationError};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::SampleBatch;
use crate::error::{ConvError, Result};
use crate::geometry::{self, ChannelTopology, FilterGeometry, LayerDims};
use crate::graph::{ComputationGraph, UnaryFunction};
use crate::matrix::Matrix;
use crate::ops::{
    AveragePool, Convolution, CrossCorrelation, CyclicPool, MaxPool, RandomPool, SlidingWindowOperator,
    WinogradConvolution,
};
use crate::weights::{ConvolutionVariant, Initialization, WeightSet};

/// Declarative configuration of a spatial layer.
///
/// Keys are camelCase; unknown keys and mistyped values are rejected.
/// `filterSize` sets both axes unless `filterRowSize` or `filterColumnSize`
/// override it; it is ignored once both are given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LayerConfig {
    pub filters: usize,
    pub filter_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_row_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_column_size: Option<usize>,
    pub stride: usize,
    pub dilation: usize,
    pub regulate_weights: bool,
    pub is_depth_separable: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            filters: 1,
            filter_size: 3,
            filter_row_size: None,
            filter_column_size: None,
            stride: 1,
            dilation: 1,
            regulate_weights: false,
            is_depth_separable: false,
        }
    }
}

impl Validate for LayerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.problem() {
            Some(_) => Err(ValidationError),
            None => Ok(()),
        }
    }
}

impl LayerConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    /// `Config` on malformed JSON, unknown keys, wrong types or
    /// non-positive values.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConvError::config(e.to_string()))?;
        config.validated()
    }

    /// Serialises the configuration to JSON.
    ///
    /// # Errors
    /// `Config` if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ConvError::config(e.to_string()))
    }

    /// Passes the configuration through the trust boundary.
    ///
    /// # Errors
    /// `Config` if any count or size is zero.
    pub fn validated(self) -> Result<Self> {
        let reason = self.problem();
        TrustedData::new(self)
            .map(TrustedData::into_inner)
            .map_err(|_| ConvError::config(reason.unwrap_or_else(|| "rejected layer configuration".into())))
    }

    fn problem(&self) -> Option<String> {
        let rows = if self.filter_row_size.is_some() { "filterRowSize" } else { "filterSize" };
        let columns = if self.filter_column_size.is_some() { "filterColumnSize" } else { "filterSize" };
        [
            ("filters", self.filters),
            (rows, self.filter_rows()),
            (columns, self.filter_columns()),
            ("stride", self.stride),
            ("dilation", self.dilation),
        ]
        .into_iter()
        .find(|&(_, value)| value == 0)
        .map(|(key, _)| format!("{key} must be at least 1"))
    }

    pub fn filter_rows(&self) -> usize {
        self.filter_row_size.unwrap_or(self.filter_size)
    }

    pub fn filter_columns(&self) -> usize {
        self.filter_column_size.unwrap_or(self.filter_size)
    }

    /// # Errors
    /// `Dimension` if a size is zero.
    pub fn geometry(&self) -> Result<FilterGeometry> {
        FilterGeometry::new(self.filter_rows(), self.filter_columns(), self.stride, self.dilation)
    }
}

/// Behaviour shared by every layer adapter.
pub trait Layer {
    fn input_dims(&self) -> LayerDims;

    fn output_dims(&self) -> LayerDims;

    /// Human-readable summary.
    fn details(&self) -> String;

    /// Runs the layer on one sample (`input_dims().depth` channel matrices),
    /// recording every operation into `graph`.
    ///
    /// # Errors
    /// `Dimension` if the sample does not match the input dimensions,
    /// `GraphConflict` if an input belongs to another graph.
    fn forward(&self, graph: &mut ComputationGraph, inputs: &[Matrix]) -> Result<Vec<Matrix>>;

    /// Forward pass on a scratch graph; outputs come back untagged.
    ///
    /// # Errors
    /// As [`Layer::forward`], except that inputs never conflict.
    fn infer(&self, inputs: &[Matrix]) -> Result<Vec<Matrix>> {
        let inputs: Vec<Matrix> = inputs
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.detach();
                m
            })
            .collect();
        let mut graph = ComputationGraph::new();
        let mut outputs = self.forward(&mut graph, &inputs)?;
        outputs.iter_mut().for_each(Matrix::detach);
        Ok(outputs)
    }

    /// Infers every sample of `batch` in parallel.
    ///
    /// # Errors
    /// The first error raised by any sample.
    fn infer_batch(&self, batch: &SampleBatch) -> Result<BTreeMap<usize, Vec<Matrix>>>
    where
        Self: Sync,
    {
        batch
            .snapshot()
            .into_par_iter()
            .map(|(index, sample)| self.infer(&sample).map(|out| (index, out)))
            .collect()
    }
}

fn check_inputs(dims: LayerDims, inputs: &[Matrix]) -> Result<()> {
    if inputs.len() != dims.depth {
        return Err(ConvError::dimension(format!(
            "layer expects {} channels, got {}",
            dims.depth,
            inputs.len()
        )));
    }
    if let Some(bad) = inputs
        .iter()
        .find(|m| m.rows() != dims.width || m.columns() != dims.height)
    {
        return Err(ConvError::dimension(format!(
            "layer expects {}x{} channels, got {}x{}",
            dims.width,
            dims.height,
            bad.rows(),
            bad.columns()
        )));
    }
    Ok(())
}

/// Sliding-window operator backing a convolutional layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvolutionKind {
    #[default]
    Convolution,
    Crosscorrelation,
    /// Winograd fast convolution; 3x3 filters, stride 1, dilation 1 only.
    Winograd,
}

impl ConvolutionKind {
    fn operator(self, geometry: FilterGeometry) -> Result<Arc<dyn SlidingWindowOperator>> {
        Ok(match self {
            Self::Convolution => Arc::new(Convolution::new(geometry)),
            Self::Crosscorrelation => Arc::new(CrossCorrelation::new(geometry)),
            Self::Winograd => Arc::new(WinogradConvolution::new(geometry)?),
        })
    }
}

/// Convolutional layer parameterised by operator and channel variant.
#[derive(Debug)]
pub struct ConvolutionalLayer {
    config: LayerConfig,
    kind: ConvolutionKind,
    variant: ConvolutionVariant,
    geometry: FilterGeometry,
    input_dims: LayerDims,
    output_dims: LayerDims,
    weights: WeightSet,
    spatial: Arc<dyn SlidingWindowOperator>,
    pointwise: Arc<dyn SlidingWindowOperator>,
    activation: Option<UnaryFunction>,
}

impl ConvolutionalLayer {
    /// Validates `config`, resolves dimensions and allocates weights.
    ///
    /// # Errors
    /// `Config` for an invalid configuration, `Dimension` if the geometry does
    /// not fit `input_dims`, `Geometry` if `kind` cannot run on the geometry.
    pub fn new(
        config: LayerConfig,
        input_dims: LayerDims,
        variant: ConvolutionVariant,
        kind: ConvolutionKind,
        initialization: Initialization,
        seed: u64,
    ) -> Result<Self> {
        let config = config.validated()?;
        let geometry = config.geometry()?;
        let pointwise: Arc<dyn SlidingWindowOperator> = Arc::new(CrossCorrelation::new(FilterGeometry::unit()));
        let spatial = match variant {
            ConvolutionVariant::Pointwise => Arc::clone(&pointwise),
            _ => kind.operator(geometry)?,
        };

        let mut weights = WeightSet::new(initialization, seed);
        let output_dims = variant.build(input_dims, &geometry, config.filters, config.regulate_weights, &mut weights)?;
        let input_dims = variant.input_dims(input_dims);
        debug!(
            "{variant:?} {kind:?} layer {}x{}x{} -> {}x{}x{} with {} parameters",
            input_dims.width,
            input_dims.height,
            input_dims.depth,
            output_dims.width,
            output_dims.height,
            output_dims.depth,
            weights.number_of_parameters()
        );

        Ok(Self {
            config,
            kind,
            variant,
            geometry,
            input_dims,
            output_dims,
            weights,
            spatial,
            pointwise,
            activation: None,
        })
    }

    /// Picks `Depthwise` when `isDepthSeparable` is set, `Standard` otherwise.
    ///
    /// # Errors
    /// As [`ConvolutionalLayer::new`].
    pub fn from_config(
        config: LayerConfig,
        input_dims: LayerDims,
        kind: ConvolutionKind,
        initialization: Initialization,
        seed: u64,
    ) -> Result<Self> {
        let variant = if config.is_depth_separable {
            ConvolutionVariant::Depthwise
        } else {
            ConvolutionVariant::Standard
        };
        Self::new(config, input_dims, variant, kind, initialization, seed)
    }

    /// Applies `activation` to every output channel.
    #[must_use]
    pub fn with_activation(mut self, activation: UnaryFunction) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn kind(&self) -> ConvolutionKind {
        self.kind
    }

    pub fn variant(&self) -> ConvolutionVariant {
        self.variant
    }

    pub fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    /// Weights for an external optimizer.
    pub fn weights_mut(&mut self) -> &mut WeightSet {
        &mut self.weights
    }

    pub fn number_of_parameters(&self) -> usize {
        self.weights.number_of_parameters()
    }

    /// Re-seeds weights and zeroes biases.
    ///
    /// # Errors
    /// `Config` if the initialization cannot sample.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.weights.reinitialize()
    }

    /// Every filter over every channel, summed per filter, plus the bias.
    fn mix(
        &self,
        graph: &mut ComputationGraph,
        operator: &Arc<dyn SlidingWindowOperator>,
        inputs: &[Matrix],
        (weight, bias): (&str, &str),
    ) -> Result<Vec<Matrix>> {
        let weights = self.weights.require(weight)?;
        let biases = self.weights.require(bias)?;
        let filters = biases.slices().len();
        let mut outputs = Vec::with_capacity(filters);
        for f in 0..filters {
            let mut acc: Option<Matrix> = None;
            for (c, input) in inputs.iter().enumerate() {
                let y = graph.window(operator, input, Some(&weights.slices()[c * filters + f]))?;
                acc = Some(match acc {
                    None => y,
                    Some(sum) => graph.add(&sum, &y)?,
                });
            }
            let acc = acc.ok_or_else(|| ConvError::dimension("layer has no input channels"))?;
            outputs.push(graph.add(&acc, &biases.slices()[f])?);
        }
        Ok(outputs)
    }

    /// One filter per channel, plus the per-channel bias.
    fn per_channel(&self, graph: &mut ComputationGraph, inputs: &[Matrix]) -> Result<Vec<Matrix>> {
        let weights = self.weights.require("WD")?;
        let biases = self.weights.require("BD")?;
        inputs
            .iter()
            .enumerate()
            .map(|(c, input)| {
                let y = graph.window(&self.spatial, input, Some(&weights.slices()[c]))?;
                graph.add(&y, &biases.slices()[c])
            })
            .collect()
    }
}

impl Layer for ConvolutionalLayer {
    fn input_dims(&self) -> LayerDims {
        self.input_dims
    }

    fn output_dims(&self) -> LayerDims {
        self.output_dims
    }

    fn details(&self) -> String {
        format!(
            "{:?} {:?}: filters {}, filter {}x{}, stride {}, dilation {}, activation {}, parameters {}",
            self.variant,
            self.kind,
            self.output_dims.depth,
            self.geometry.filter_rows(),
            self.geometry.filter_columns(),
            self.geometry.stride(),
            self.geometry.dilation(),
            self.activation.map_or("none", |a| a.name),
            self.number_of_parameters()
        )
    }

    fn forward(&self, graph: &mut ComputationGraph, inputs: &[Matrix]) -> Result<Vec<Matrix>> {
        check_inputs(self.input_dims, inputs)?;
        let outputs = match self.variant {
            ConvolutionVariant::Standard | ConvolutionVariant::Single => {
                self.mix(graph, &self.spatial, inputs, ("W", "B"))?
            }
            ConvolutionVariant::Depthwise => self.per_channel(graph, inputs)?,
            ConvolutionVariant::Pointwise => self.mix(graph, &self.pointwise, inputs, ("WP", "BP"))?,
            ConvolutionVariant::DepthwiseSeparable => {
                let spatial = self.per_channel(graph, inputs)?;
                self.mix(graph, &self.pointwise, &spatial, ("WP", "BP"))?
            }
        };
        match self.activation {
            Some(activation) => outputs.iter().map(|m| graph.apply(m, activation)).collect(),
            None => Ok(outputs),
        }
    }
}

/// Pooling flavour of a [`PoolingLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingKind {
    Max,
    Average,
    Cyclic,
    Random,
}

/// Weightless pooling layer; every channel is pooled independently.
#[derive(Debug)]
pub struct PoolingLayer {
    kind: PoolingKind,
    geometry: FilterGeometry,
    input_dims: LayerDims,
    output_dims: LayerDims,
    operator: Arc<dyn SlidingWindowOperator>,
}

impl PoolingLayer {
    /// # Errors
    /// `Dimension` if the geometry does not fit `input_dims`.
    pub fn new(kind: PoolingKind, geometry: FilterGeometry, input_dims: LayerDims) -> Result<Self> {
        let operator: Arc<dyn SlidingWindowOperator> = match kind {
            PoolingKind::Max => Arc::new(MaxPool::new(geometry)),
            PoolingKind::Average => Arc::new(AveragePool::new(geometry)),
            PoolingKind::Cyclic => Arc::new(CyclicPool::new(geometry)),
            PoolingKind::Random => Arc::new(RandomPool::new(geometry)),
        };
        Self::with_operator(kind, geometry, input_dims, operator)
    }

    /// Like [`PoolingLayer::new`], with a reproducible seed for random pooling.
    ///
    /// # Errors
    /// `Dimension` if the geometry does not fit `input_dims`.
    pub fn with_seed(kind: PoolingKind, geometry: FilterGeometry, input_dims: LayerDims, seed: u64) -> Result<Self> {
        match kind {
            PoolingKind::Random => {
                Self::with_operator(kind, geometry, input_dims, Arc::new(RandomPool::with_seed(geometry, seed)))
            }
            _ => Self::new(kind, geometry, input_dims),
        }
    }

    /// Pooling geometry taken from `filterSize`, `stride` and `dilation`.
    ///
    /// # Errors
    /// `Config` or `Dimension`.
    pub fn from_config(kind: PoolingKind, config: LayerConfig, input_dims: LayerDims) -> Result<Self> {
        let config = config.validated()?;
        Self::new(kind, config.geometry()?, input_dims)
    }

    fn with_operator(
        kind: PoolingKind,
        geometry: FilterGeometry,
        input_dims: LayerDims,
        operator: Arc<dyn SlidingWindowOperator>,
    ) -> Result<Self> {
        let output_dims = geometry::resolve(input_dims, &geometry, input_dims.depth, ChannelTopology::Full)?;
        debug!(
            "{kind:?} pooling layer {}x{}x{} -> {}x{}x{}",
            input_dims.width, input_dims.height, input_dims.depth, output_dims.width, output_dims.height, output_dims.depth
        );
        Ok(Self {
            kind,
            geometry,
            input_dims,
            output_dims,
            operator,
        })
    }

    pub fn kind(&self) -> PoolingKind {
        self.kind
    }

    pub fn geometry(&self) -> FilterGeometry {
        self.geometry
    }
}

impl Layer for PoolingLayer {
    fn input_dims(&self) -> LayerDims {
        self.input_dims
    }

    fn output_dims(&self) -> LayerDims {
        self.output_dims
    }

    fn details(&self) -> String {
        format!(
            "{:?} pooling: pool {}x{}, stride {}, dilation {}",
            self.kind,
            self.geometry.filter_rows(),
            self.geometry.filter_columns(),
            self.geometry.stride(),
            self.geometry.dilation()
        )
    }

    fn forward(&self, graph: &mut ComputationGraph, inputs: &[Matrix]) -> Result<Vec<Matrix>> {
        check_inputs(self.input_dims, inputs)?;
        inputs
            .iter()
            .map(|input| graph.window(&self.operator, input, None))
            .collect()
    }
}
