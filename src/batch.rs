//! Thread-safe container of samples awaiting a forward pass.
//!
//! A data loader inserts samples while forward-pass workers read them; the map
//! sits behind a [`Mutex`] so neither side observes a half-written entry.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{ConvError, Result};
use crate::matrix::Matrix;

/// Samples keyed by index, each a list of `depth` channel matrices.
#[derive(Debug)]
pub struct SampleBatch {
    depth: usize,
    samples: Mutex<BTreeMap<usize, Vec<Matrix>>>,
}

impl SampleBatch {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    /// Channels expected per sample.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, Vec<Matrix>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the sample at `index`.
    ///
    /// # Errors
    /// `Dimension` if the sample does not have `depth` channels.
    pub fn put(&self, index: usize, channels: Vec<Matrix>) -> Result<()> {
        if channels.len() != self.depth {
            return Err(ConvError::dimension(format!(
                "sample {index} has {} channels, batch depth is {}",
                channels.len(),
                self.depth
            )));
        }
        self.lock().insert(index, channels);
        Ok(())
    }

    /// Copy of the sample at `index`.
    pub fn get(&self, index: usize) -> Option<Vec<Matrix>> {
        self.lock().get(&index).cloned()
    }

    /// Removes and returns the sample at `index`.
    pub fn take(&self, index: usize) -> Option<Vec<Matrix>> {
        self.lock().remove(&index)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sample indices in ascending order.
    pub fn indices(&self) -> Vec<usize> {
        self.lock().keys().copied().collect()
    }

    /// Copy of every sample, taken under a single lock.
    pub fn snapshot(&self) -> BTreeMap<usize, Vec<Matrix>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
