//! Dense 2D matrices with masking and slice addressing.
//!
//! # Matrix Model
//!
//! A [`Matrix`] is a row-major block of `f64` values plus the state every
//! sliding-window operator relies on:
//!
//! - a **transposition flag**: reads through a transposed matrix swap axes
//!   without moving data,
//! - a **slice window** selecting the active sub-region; `get`, `set`,
//!   `rows`, `columns` and every reduction address only that region,
//! - a **scaling constant** multiplied into the results of the elementwise,
//!   product and windowed operations whose left operand is this matrix,
//! - an optional **mask** (see [`mask`]) whose excluded positions are skipped,
//! - a stable [`MatrixId`] and the identity of the computation graph, if any,
//!   that produced the matrix.
//!
//! ## Invariants
//! - The slice window always lies inside the matrix bounds.
//! - A mask, when present, covers the full (unsliced) logical matrix.
//!
//! ## Example
//!
//! ```rust
//! use briny_conv::matrix;
//!
//! let mut m = matrix!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
//! m.slice_at(0, 1, 2, 2).unwrap();
//! assert_eq!(m.values(), vec![2.0, 3.0, 5.0, 6.0]);
//! m.unslice();
//! assert_eq!(m.rows(), 2);
//! ```

pub mod mask;
mod ops;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ConvError, Result};
use crate::graph::GraphId;

use self::mask::{Mask, MaskLayer, MaskStack};

static NEXT_MATRIX_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a matrix, shared by its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixId(u64);

impl MatrixId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MATRIX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Active sub-region of a matrix, in absolute logical coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceWindow {
    /// First row of the window.
    pub row: usize,
    /// First column of the window.
    pub column: usize,
    /// Number of rows in the window.
    pub rows: usize,
    /// Number of columns in the window.
    pub columns: usize,
}

impl SliceWindow {
    fn full(rows: usize, columns: usize) -> Self {
        Self {
            row: 0,
            column: 0,
            rows,
            columns,
        }
    }
}

/// Dense 2D matrix of `f64` values.
///
/// Cloning keeps the [`MatrixId`]; use [`Matrix::duplicate`] for an
/// independent copy with a fresh identity.
#[derive(Debug, Clone)]
pub struct Matrix {
    id: MatrixId,
    name: Option<String>,
    storage_rows: usize,
    storage_columns: usize,
    data: Vec<f64>,
    transposed: bool,
    slice: SliceWindow,
    scaling: f64,
    mask: Option<Arc<Mask>>,
    stack: MaskStack,
    graph: Option<GraphId>,
}

impl Matrix {
    /// Creates a zero-filled `rows x columns` matrix.
    pub fn new(rows: usize, columns: usize) -> Self {
        Self::constant(rows, columns, 0.0)
    }

    /// Alias of [`Matrix::new`].
    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self::new(rows, columns)
    }

    /// Creates a matrix filled with `value`.
    pub fn constant(rows: usize, columns: usize, value: f64) -> Self {
        Self::from_parts(rows, columns, vec![value; rows * columns])
    }

    /// Creates a matrix from row-major data.
    ///
    /// # Errors
    /// `Shape` if `data.len() != rows * columns`.
    pub fn from_vec(rows: usize, columns: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * columns {
            return Err(ConvError::shape(format!(
                "{rows}x{columns} matrix is incompatible with {} data elements",
                data.len()
            )));
        }
        Ok(Self::from_parts(rows, columns, data))
    }

    /// Creates a matrix from a slice of rows.
    ///
    /// # Panics
    /// Panics if the rows are ragged.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let columns = rows.first().map_or(0, Vec::len);
        assert!(
            rows.iter().all(|r| r.len() == columns),
            "ragged matrix literal (rows have mismatched lengths)"
        );
        let data = rows.iter().flatten().copied().collect();
        Self::from_parts(rows.len(), columns, data)
    }

    fn from_parts(rows: usize, columns: usize, data: Vec<f64>) -> Self {
        Self {
            id: MatrixId::next(),
            name: None,
            storage_rows: rows,
            storage_columns: columns,
            data,
            transposed: false,
            slice: SliceWindow::full(rows, columns),
            scaling: 1.0,
            mask: None,
            stack: MaskStack::default(),
            graph: None,
        }
    }

    /// Sets a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Stable identity of this matrix.
    pub fn id(&self) -> MatrixId {
        self.id
    }

    /// Computation graph that produced this matrix, if any.
    pub fn graph(&self) -> Option<GraphId> {
        self.graph
    }

    pub(crate) fn set_graph(&mut self, graph: GraphId) {
        self.graph = Some(graph);
    }

    /// Forgets the graph tag, turning the matrix into a leaf.
    pub fn detach(&mut self) {
        self.graph = None;
    }

    /// Copy with a fresh identity and no graph tag.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            id: MatrixId::next(),
            graph: None,
            ..self.clone()
        }
    }

    /// Rows in the active slice window.
    pub fn rows(&self) -> usize {
        self.slice.rows
    }

    /// Columns in the active slice window.
    pub fn columns(&self) -> usize {
        self.slice.columns
    }

    /// Number of elements in the active slice window.
    pub fn size(&self) -> usize {
        self.slice.rows * self.slice.columns
    }

    /// Rows of the whole logical matrix.
    pub fn full_rows(&self) -> usize {
        if self.transposed {
            self.storage_columns
        } else {
            self.storage_rows
        }
    }

    /// Columns of the whole logical matrix.
    pub fn full_columns(&self) -> usize {
        if self.transposed {
            self.storage_rows
        } else {
            self.storage_columns
        }
    }

    /// Returns `true` if reads swap axes.
    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    #[inline]
    fn offset(&self, row: usize, column: usize) -> usize {
        if self.transposed {
            column * self.storage_columns + row
        } else {
            row * self.storage_columns + column
        }
    }

    #[inline]
    fn absolute(&self, row: usize, column: usize) -> (usize, usize) {
        assert!(
            row < self.slice.rows && column < self.slice.columns,
            "position ({row}, {column}) outside {}x{} slice",
            self.slice.rows,
            self.slice.columns
        );
        (self.slice.row + row, self.slice.column + column)
    }

    /// Value at `(row, column)` of the active slice.
    ///
    /// # Panics
    /// Panics if the position is outside the slice.
    #[inline]
    pub fn get(&self, row: usize, column: usize) -> f64 {
        let (r, c) = self.absolute(row, column);
        self.data[self.offset(r, c)]
    }

    /// Writes `value` at `(row, column)` of the active slice.
    #[inline]
    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        let (r, c) = self.absolute(row, column);
        let i = self.offset(r, c);
        self.data[i] = value;
    }

    /// Adds `value` at `(row, column)` of the active slice.
    #[inline]
    pub fn increment(&mut self, row: usize, column: usize, value: f64) {
        let (r, c) = self.absolute(row, column);
        let i = self.offset(r, c);
        self.data[i] += value;
    }

    /// Active slice values in row-major order.
    pub fn values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.size());
        for r in 0..self.rows() {
            for c in 0..self.columns() {
                out.push(self.get(r, c));
            }
        }
        out
    }

    /// Active slice values as nested rows.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.rows())
            .map(|r| (0..self.columns()).map(|c| self.get(r, c)).collect())
            .collect()
    }

    /// Overwrites every element of the active slice with `value`.
    pub fn fill(&mut self, value: f64) {
        for r in 0..self.rows() {
            for c in 0..self.columns() {
                self.set(r, c, value);
            }
        }
    }

    /// Zeroes the whole matrix, ignoring the slice window.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }

    /// Restricts the active region to `rows x columns` starting at
    /// `(row, column)` in absolute coordinates.
    ///
    /// # Errors
    /// `Dimension` if the window is empty or leaves the matrix bounds.
    pub fn slice_at(&mut self, row: usize, column: usize, rows: usize, columns: usize) -> Result<()> {
        if rows == 0 || columns == 0 || row + rows > self.full_rows() || column + columns > self.full_columns() {
            return Err(ConvError::dimension(format!(
                "slice {rows}x{columns} at ({row}, {column}) is outside {}x{} matrix",
                self.full_rows(),
                self.full_columns()
            )));
        }
        self.slice = SliceWindow {
            row,
            column,
            rows,
            columns,
        };
        Ok(())
    }

    /// Restores the full matrix as the active region.
    pub fn unslice(&mut self) {
        self.slice = SliceWindow::full(self.full_rows(), self.full_columns());
    }

    /// Current slice window.
    pub fn slice(&self) -> SliceWindow {
        self.slice
    }

    /// Borrowed read-only view of a sub-region of the active slice.
    ///
    /// # Errors
    /// `Dimension` if the region leaves the active slice.
    pub fn window(&self, row: usize, column: usize, rows: usize, columns: usize) -> Result<Window<'_>> {
        if row + rows > self.rows() || column + columns > self.columns() {
            return Err(ConvError::dimension(format!(
                "window {rows}x{columns} at ({row}, {column}) is outside {}x{} slice",
                self.rows(),
                self.columns()
            )));
        }
        Ok(Window {
            matrix: self,
            row,
            column,
            rows,
            columns,
        })
    }

    /// Scaling constant applied to operation results.
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Sets the scaling constant.
    pub fn set_scaling_constant(&mut self, scaling: f64) {
        self.scaling = scaling;
    }

    /// Resets the scaling constant to `1`.
    pub fn unset_scaling_constant(&mut self) {
        self.scaling = 1.0;
    }

    /// Transposed copy with a fresh identity; the mask is transposed with it.
    #[must_use]
    pub fn transpose(&self) -> Self {
        let mut out = self.to_dense();
        out.transposed = true;
        out.slice = SliceWindow::full(out.full_rows(), out.full_columns());
        out.mask = out.mask.map(|m| Arc::new(m.transpose()));
        out
    }

    /// Copy of the active slice with both axes reversed.
    #[must_use]
    pub fn flip(&self) -> Self {
        let mut out = self.to_dense();
        out.data.reverse();
        out.mask = out.mask.map(|m| Arc::new(m.flip()));
        out
    }

    /// Materialises the active slice into a fresh, untransposed matrix that
    /// keeps the name, scaling constant and the matching part of the mask.
    #[must_use]
    pub fn to_dense(&self) -> Self {
        let mut out = Self::from_parts(self.rows(), self.columns(), self.values());
        out.name.clone_from(&self.name);
        out.scaling = self.scaling;
        out.mask = self.cropped_mask();
        out
    }

    /// Zero matrix with the dimensions of the active slice.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self::new(self.rows(), self.columns())
    }

    /// Returns `true` if both active slices have the same dimensions.
    pub fn has_equal_size(&self, other: &Matrix) -> bool {
        self.rows() == other.rows() && self.columns() == other.columns()
    }

    pub(crate) fn ensure_equal_size(&self, other: &Matrix, what: &str) -> Result<()> {
        if !self.has_equal_size(other) {
            return Err(ConvError::shape(format!(
                "{what}: {}x{} and {}x{} operands differ",
                self.rows(),
                self.columns(),
                other.rows(),
                other.columns()
            )));
        }
        Ok(())
    }

    // ---- masking ----

    /// Returns `true` if a mask is attached.
    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// Returns `true` if `(row, column)` of the active slice is excluded.
    #[inline]
    pub fn is_masked(&self, row: usize, column: usize) -> bool {
        match &self.mask {
            None => false,
            Some(mask) => {
                let (r, c) = self.absolute(row, column);
                mask.is_masked(r, c)
            }
        }
    }

    /// Attaches a clear mask if none is set.
    pub fn set_mask(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(Arc::new(Mask::new(self.full_rows(), self.full_columns())));
        }
    }

    /// Replaces the mask.
    ///
    /// # Errors
    /// `Mask` if the mask does not cover the full matrix.
    pub fn set_mask_with(&mut self, mask: Mask) -> Result<()> {
        if mask.rows() != self.full_rows() || mask.columns() != self.full_columns() {
            return Err(ConvError::mask(format!(
                "{}x{} mask does not fit {}x{} matrix",
                mask.rows(),
                mask.columns(),
                self.full_rows(),
                self.full_columns()
            )));
        }
        self.mask = Some(Arc::new(mask));
        Ok(())
    }

    /// Detaches the mask.
    pub fn unset_mask(&mut self) {
        self.mask = None;
    }

    /// The attached mask.
    ///
    /// # Errors
    /// `Mask` if no mask is set.
    pub fn mask(&self) -> Result<&Mask> {
        self.mask
            .as_deref()
            .ok_or_else(|| ConvError::mask("matrix has no mask set"))
    }

    /// Mutable access to the mask, copying it first if a snapshot shares it.
    ///
    /// # Errors
    /// `Mask` if no mask is set.
    pub fn mask_mut(&mut self) -> Result<&mut Mask> {
        self.mask
            .as_mut()
            .map(Arc::make_mut)
            .ok_or_else(|| ConvError::mask("matrix has no mask set"))
    }

    /// Mask restricted to the active slice.
    pub(crate) fn cropped_mask(&self) -> Option<Arc<Mask>> {
        let mask = self.mask.as_ref()?;
        if self.slice == SliceWindow::full(self.full_rows(), self.full_columns()) {
            return Some(Arc::clone(mask));
        }
        let s = self.slice;
        Some(Arc::new(mask.crop(s.row, s.column, s.rows, s.columns)))
    }

    /// Sets the element layer at `(row, column)` of the active slice.
    ///
    /// # Errors
    /// `Mask` if no mask is set.
    pub fn set_mask_at(&mut self, row: usize, column: usize, value: bool) -> Result<()> {
        let (r, c) = self.absolute(row, column);
        self.mask_mut()?.set(r, c, value);
        Ok(())
    }

    /// Sets the row layer for `row` of the active slice.
    ///
    /// # Errors
    /// `Mask` if no mask is set.
    pub fn set_row_mask(&mut self, row: usize, value: bool) -> Result<()> {
        let (r, _) = self.absolute(row, 0);
        self.mask_mut()?.set_row(r, value);
        Ok(())
    }

    /// Sets the column layer for `column` of the active slice.
    ///
    /// # Errors
    /// `Mask` if no mask is set.
    pub fn set_column_mask(&mut self, column: usize, value: bool) -> Result<()> {
        let (_, c) = self.absolute(0, column);
        self.mask_mut()?.set_column(c, value);
        Ok(())
    }

    fn stack_layer(&mut self, layer: MaskLayer, reset: bool) {
        self.stack.push(layer, self.mask.clone());
        if !reset {
            return;
        }
        match layer {
            MaskLayer::Element => {
                self.mask = Some(Arc::new(Mask::new(self.full_rows(), self.full_columns())));
            }
            MaskLayer::Row | MaskLayer::Column => {
                self.set_mask();
                if let Some(mask) = self.mask.as_mut() {
                    Arc::make_mut(mask).clear_layer(layer);
                }
            }
        }
    }

    fn unstack_layer(&mut self, layer: MaskLayer) -> Result<()> {
        let snapshot = self.stack.pop(layer)?;
        match layer {
            MaskLayer::Element => self.mask = snapshot,
            MaskLayer::Row | MaskLayer::Column => match snapshot {
                Some(saved) => {
                    self.set_mask();
                    if let Some(mask) = self.mask.as_mut() {
                        Arc::make_mut(mask).copy_layer_from(layer, &saved);
                    }
                }
                None => {
                    if let Some(mask) = self.mask.as_mut() {
                        Arc::make_mut(mask).clear_layer(layer);
                    }
                }
            },
        }
        Ok(())
    }

    /// Pushes the current mask; with `reset` a fresh clear mask replaces it.
    pub fn stack_mask(&mut self, reset: bool) {
        self.stack_layer(MaskLayer::Element, reset);
    }

    /// Restores the most recently stacked mask.
    ///
    /// # Errors
    /// `Mask` if the stack is empty.
    pub fn unstack_mask(&mut self) -> Result<()> {
        self.unstack_layer(MaskLayer::Element)
    }

    /// Pushes the row layer; with `reset` the row layer is cleared.
    pub fn stack_row_mask(&mut self, reset: bool) {
        self.stack_layer(MaskLayer::Row, reset);
    }

    /// Restores the most recently stacked row layer.
    ///
    /// # Errors
    /// `Mask` if the stack is empty.
    pub fn unstack_row_mask(&mut self) -> Result<()> {
        self.unstack_layer(MaskLayer::Row)
    }

    /// Pushes the column layer; with `reset` the column layer is cleared.
    pub fn stack_column_mask(&mut self, reset: bool) {
        self.stack_layer(MaskLayer::Column, reset);
    }

    /// Restores the most recently stacked column layer.
    ///
    /// # Errors
    /// `Mask` if the stack is empty.
    pub fn unstack_column_mask(&mut self) -> Result<()> {
        self.unstack_layer(MaskLayer::Column)
    }

    /// Depth of the mask stack for `layer`.
    pub fn mask_stack_size(&self, layer: MaskLayer) -> usize {
        self.stack.len(layer)
    }

    /// Drops every stacked snapshot of `layer`.
    pub fn clear_mask_stack(&mut self, layer: MaskLayer) {
        self.stack.clear(layer);
    }
}

/// Borrowed read-only sub-region of a matrix.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a> {
    matrix: &'a Matrix,
    row: usize,
    column: usize,
    rows: usize,
    columns: usize,
}

impl Window<'_> {
    /// Rows in the window.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns in the window.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Value at `(row, column)` relative to the window.
    #[inline]
    pub fn get(&self, row: usize, column: usize) -> f64 {
        debug_assert!(row < self.rows && column < self.columns);
        self.matrix.get(self.row + row, self.column + column)
    }

    /// Mask predicate at `(row, column)` relative to the window.
    #[inline]
    pub fn is_masked(&self, row: usize, column: usize) -> bool {
        self.matrix.is_masked(self.row + row, self.column + column)
    }
}

/// Defines a matrix from nested literal rows.
///
/// # Example
/// ```
/// use briny_conv::matrix;
/// let m = matrix!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!((m.rows(), m.columns()), (2, 2));
/// ```
#[macro_export]
macro_rules! matrix {
    ([ $( [ $( $x:expr ),* $(,)? ] ),+ $(,)? ]) => {
        $crate::matrix::Matrix::from_rows(&[ $( vec![ $( f64::from($x) ),* ] ),+ ])
    };
}
