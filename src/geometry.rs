//! Filter geometry and output-dimension resolution.
//!
//! Dilation inflates a filter before any divisibility check:
//!
//! ```text
//! effective = size + (size - 1) * (dilation - 1)
//! output    = (previous - effective) / stride + 1
//! ```
//!
//! which is only valid when `(previous - effective) % stride == 0` and the
//! output extent is at least one. Configured sizes are never rewritten; the
//! effective sizes are always derived.

use crate::error::{ConvError, Result};

/// Filter size, stride and dilation of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterGeometry {
    filter_rows: usize,
    filter_columns: usize,
    stride: usize,
    dilation: usize,
}

impl FilterGeometry {
    /// Creates a geometry.
    ///
    /// # Errors
    /// `Dimension` if any value is zero or the dilated filter extent overflows.
    pub fn new(filter_rows: usize, filter_columns: usize, stride: usize, dilation: usize) -> Result<Self> {
        if filter_rows == 0 || filter_columns == 0 || stride == 0 || dilation == 0 {
            return Err(ConvError::dimension(format!(
                "filter {filter_rows}x{filter_columns}, stride {stride} and dilation {dilation} must all be positive"
            )));
        }
        effective_size(filter_rows, dilation)?;
        effective_size(filter_columns, dilation)?;
        Ok(Self {
            filter_rows,
            filter_columns,
            stride,
            dilation,
        })
    }

    /// Square `size x size` filter with stride and dilation 1.
    ///
    /// # Errors
    /// `Dimension` if `size` is zero.
    pub fn square(size: usize) -> Result<Self> {
        Self::new(size, size, 1, 1)
    }

    /// The 1x1 geometry of pointwise stages.
    pub const fn unit() -> Self {
        Self {
            filter_rows: 1,
            filter_columns: 1,
            stride: 1,
            dilation: 1,
        }
    }

    /// Same filter with another stride.
    ///
    /// # Errors
    /// `Dimension` if `stride` is zero.
    pub fn with_stride(self, stride: usize) -> Result<Self> {
        Self::new(self.filter_rows, self.filter_columns, stride, self.dilation)
    }

    /// Same filter with another dilation.
    ///
    /// # Errors
    /// `Dimension` if `dilation` is zero.
    pub fn with_dilation(self, dilation: usize) -> Result<Self> {
        Self::new(self.filter_rows, self.filter_columns, self.stride, dilation)
    }

    pub fn filter_rows(&self) -> usize {
        self.filter_rows
    }

    pub fn filter_columns(&self) -> usize {
        self.filter_columns
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Number of taps in the window.
    pub fn taps(&self) -> usize {
        self.filter_rows * self.filter_columns
    }

    /// Row extent after dilation.
    pub fn effective_rows(&self) -> usize {
        inflate(self.filter_rows, self.dilation).unwrap_or(usize::MAX)
    }

    /// Column extent after dilation.
    pub fn effective_columns(&self) -> usize {
        inflate(self.filter_columns, self.dilation).unwrap_or(usize::MAX)
    }

    /// Output `(rows, columns)` for a `rows x columns` input.
    ///
    /// # Errors
    /// `Dimension` if either axis violates the stride/dilation invariant.
    pub fn output_size(&self, rows: usize, columns: usize) -> Result<(usize, usize)> {
        Ok((
            output_extent(rows, self.filter_rows, self.stride, self.dilation)?,
            output_extent(columns, self.filter_columns, self.stride, self.dilation)?,
        ))
    }
}

/// Filter extent after inserting `dilation - 1` gaps between taps.
///
/// # Errors
/// `Dimension` if `size` or `dilation` is zero, or the extent overflows.
pub fn effective_size(size: usize, dilation: usize) -> Result<usize> {
    inflate(size, dilation).ok_or_else(|| {
        ConvError::dimension(format!(
            "filter size {size} with dilation {dilation} has no representable effective size"
        ))
    })
}

const fn inflate(size: usize, dilation: usize) -> Option<usize> {
    let (Some(gaps), Some(spread)) = (size.checked_sub(1), dilation.checked_sub(1)) else {
        return None;
    };
    match gaps.checked_mul(spread) {
        Some(inflation) => size.checked_add(inflation),
        None => None,
    }
}

/// Output extent along one axis.
///
/// # Errors
/// `Dimension` if `previous` is zero, smaller than the dilated filter, or not
/// tiled exactly by `stride`.
pub fn output_extent(previous: usize, filter: usize, stride: usize, dilation: usize) -> Result<usize> {
    if previous == 0 {
        return Err(ConvError::dimension("previous layer extent must be positive"));
    }
    if filter == 0 || stride == 0 || dilation == 0 {
        return Err(ConvError::dimension(format!(
            "filter {filter}, stride {stride} and dilation {dilation} must all be positive"
        )));
    }
    let effective = effective_size(filter, dilation)?;
    if previous < effective {
        return Err(ConvError::dimension(format!(
            "effective filter size {effective} exceeds input extent {previous}"
        )));
    }
    if (previous - effective) % stride != 0 {
        return Err(ConvError::dimension(format!(
            "input extent {previous} minus effective filter size {effective} is not divisible by stride {stride}"
        )));
    }
    Ok((previous - effective) / stride + 1)
}

/// Width, height and depth of a layer.
///
/// Width runs along matrix rows, height along matrix columns; each channel is
/// one `width x height` matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerDims {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl LayerDims {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    /// Elements in one channel.
    pub const fn area(&self) -> usize {
        self.width * self.height
    }
}

/// How output channels relate to input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTopology {
    /// Every filter sees every input channel.
    Full,
    /// One filter per input channel; the filter count must equal the input depth.
    DepthSeparable,
    /// A single output channel; input depth is collapsed.
    Single,
}

/// Derives output dimensions of a sliding-window stage.
///
/// # Errors
/// `Dimension` if a previous dimension or the filter count is zero, if either
/// spatial axis violates the stride/dilation invariant, or if a depth-separable
/// stage is given a filter count different from the input depth.
pub fn resolve(
    previous: LayerDims,
    geometry: &FilterGeometry,
    filters: usize,
    topology: ChannelTopology,
) -> Result<LayerDims> {
    if previous.width == 0 || previous.height == 0 || previous.depth == 0 {
        return Err(ConvError::dimension(format!(
            "previous layer dimensions {}x{}x{} must all be positive",
            previous.width, previous.height, previous.depth
        )));
    }
    if filters == 0 {
        return Err(ConvError::dimension("number of filters must be positive"));
    }

    let (width, height) = geometry.output_size(previous.width, previous.height)?;
    let depth = match topology {
        ChannelTopology::Full => filters,
        ChannelTopology::DepthSeparable if filters != previous.depth => {
            return Err(ConvError::dimension(format!(
                "depth-separable stage needs one filter per channel: {filters} filters for depth {}",
                previous.depth
            )));
        }
        ChannelTopology::DepthSeparable => filters,
        ChannelTopology::Single => 1,
    };

    Ok(LayerDims { width, height, depth })
}
