//! Error kinds raised by the engine.
//!
//! Every failure here is a programmer or configuration mistake. Nothing is
//! retried and nothing degrades: errors propagate to the caller unmodified.

use crate::graph::GraphId;
use thiserror::Error;

/// The crate-wide error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvError {
    /// Non-positive input dimension, a stride/dilation combination that does not
    /// tile the input, an output extent below one, or a channel-count mismatch.
    #[error("dimension error: {0}")]
    Dimension(String),

    /// The fixed-geometry fast convolution was asked to run outside 3x3 / dilation 1.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Access to an unset mask, or a pop from an empty mask stack.
    #[error("mask error: {0}")]
    Mask(String),

    /// Two computation graphs met in one expression.
    #[error("conflicting computation graphs {first} and {second} in one expression")]
    GraphConflict {
        /// Graph carried by the first conflicting party.
        first: GraphId,
        /// Graph carried by the second conflicting party.
        second: GraphId,
    },

    /// Operand shapes do not agree, or a required operand is missing.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A layer configuration could not be parsed or validated.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConvError {
    pub(crate) fn dimension(msg: impl Into<String>) -> Self {
        Self::Dimension(msg.into())
    }

    pub(crate) fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    pub(crate) fn mask(msg: impl Into<String>) -> Self {
        Self::Mask(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ConvError> = core::result::Result<T, E>;
