//! Element, row and column exclusion masks.
//!
//! A position is excluded when any of the three layers marks it:
//! `row[r] || column[c] || element[r, c]`. Operators skip excluded positions
//! entirely instead of treating them as zero, so counts used by means and
//! averages only see unmasked elements.
//!
//! Masks are shared behind [`Arc`] and copied on write. Stacking a mask stores
//! the current `Arc` in an arena of immutable snapshots and pushes its index;
//! unstacking restores from that index. Nothing in the arena is ever mutated.

use std::sync::Arc;

use rand::Rng;

use crate::error::{ConvError, Result};

/// Three independent boolean exclusion layers over a `rows x columns` grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    rows: usize,
    columns: usize,
    element: Vec<bool>,
    row: Vec<bool>,
    column: Vec<bool>,
}

impl Mask {
    /// Creates a mask with nothing excluded.
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            element: vec![false; rows * columns],
            row: vec![false; rows],
            column: vec![false; columns],
        }
    }

    /// Number of rows covered by the mask.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns covered by the mask.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Returns `true` if `(row, column)` is excluded by any layer.
    ///
    /// # Panics
    /// Panics if the position lies outside the mask.
    #[inline]
    pub fn is_masked(&self, row: usize, column: usize) -> bool {
        assert!(
            row < self.rows && column < self.columns,
            "mask position ({row}, {column}) outside {}x{}",
            self.rows,
            self.columns
        );
        self.row[row] || self.column[column] || self.element[row * self.columns + column]
    }

    /// Element layer value at `(row, column)`.
    pub fn element(&self, row: usize, column: usize) -> bool {
        self.element[row * self.columns + column]
    }

    /// Row layer value.
    pub fn row(&self, row: usize) -> bool {
        self.row[row]
    }

    /// Column layer value.
    pub fn column(&self, column: usize) -> bool {
        self.column[column]
    }

    /// Sets the element layer at `(row, column)`.
    pub fn set(&mut self, row: usize, column: usize, value: bool) {
        assert!(row < self.rows && column < self.columns, "mask position out of bounds");
        self.element[row * self.columns + column] = value;
    }

    /// Sets the row layer for `row`.
    pub fn set_row(&mut self, row: usize, value: bool) {
        self.row[row] = value;
    }

    /// Sets the column layer for `column`.
    pub fn set_column(&mut self, column: usize, value: bool) {
        self.column[column] = value;
    }

    /// Clears the element layer.
    pub fn clear_elements(&mut self) {
        self.element.fill(false);
    }

    /// Clears the row layer.
    pub fn clear_rows(&mut self) {
        self.row.fill(false);
    }

    /// Clears the column layer.
    pub fn clear_columns(&mut self) {
        self.column.fill(false);
    }

    /// Number of positions excluded by any layer.
    pub fn count_masked(&self) -> usize {
        (0..self.rows)
            .map(|r| (0..self.columns).filter(|&c| self.is_masked(r, c)).count())
            .sum()
    }

    /// Returns `true` if no layer excludes anything.
    pub fn is_clear(&self) -> bool {
        !self.element.iter().chain(&self.row).chain(&self.column).any(|&m| m)
    }

    /// Logical OR of two masks of identical size, layer by layer.
    ///
    /// # Errors
    /// `Shape` if the masks cover different grids.
    pub fn union(&self, other: &Mask) -> Result<Mask> {
        if self.rows != other.rows || self.columns != other.columns {
            return Err(ConvError::shape(format!(
                "cannot unite {}x{} mask with {}x{} mask",
                self.rows, self.columns, other.rows, other.columns
            )));
        }
        let or = |a: &[bool], b: &[bool]| a.iter().zip(b).map(|(x, y)| *x || *y).collect();
        Ok(Mask {
            rows: self.rows,
            columns: self.columns,
            element: or(&self.element, &other.element),
            row: or(&self.row, &other.row),
            column: or(&self.column, &other.column),
        })
    }

    /// Swaps the roles of rows and columns.
    pub fn transpose(&self) -> Mask {
        let mut out = Mask::new(self.columns, self.rows);
        for r in 0..self.rows {
            for c in 0..self.columns {
                out.element[c * self.rows + r] = self.element[r * self.columns + c];
            }
        }
        out.row.clone_from(&self.column);
        out.column.clone_from(&self.row);
        out
    }

    /// Reverses both axes of every layer.
    pub fn flip(&self) -> Mask {
        let mut out = self.clone();
        out.element.reverse();
        out.row.reverse();
        out.column.reverse();
        out
    }

    /// Sub-mask covering `rows x columns` starting at `(row, column)`.
    pub fn crop(&self, row: usize, column: usize, rows: usize, columns: usize) -> Mask {
        assert!(row + rows <= self.rows && column + columns <= self.columns, "crop outside mask");
        let mut out = Mask::new(rows, columns);
        for r in 0..rows {
            let from = (row + r) * self.columns + column;
            out.element[r * columns..(r + 1) * columns].copy_from_slice(&self.element[from..from + columns]);
        }
        out.row.copy_from_slice(&self.row[row..row + rows]);
        out.column.copy_from_slice(&self.column[column..column + columns]);
        out
    }

    /// Masks each element independently with probability `probability`.
    ///
    /// # Errors
    /// `Mask` if `probability` is outside `[0, 1]`.
    pub fn mask_by_probability<R: Rng>(&mut self, probability: f64, rng: &mut R) -> Result<()> {
        check_probability(probability)?;
        for m in &mut self.element {
            *m = rng.random::<f64>() < probability;
        }
        Ok(())
    }

    /// Masks each row independently with probability `probability`.
    ///
    /// # Errors
    /// `Mask` if `probability` is outside `[0, 1]`.
    pub fn mask_rows_by_probability<R: Rng>(&mut self, probability: f64, rng: &mut R) -> Result<()> {
        check_probability(probability)?;
        for m in &mut self.row {
            *m = rng.random::<f64>() < probability;
        }
        Ok(())
    }

    /// Masks each column independently with probability `probability`.
    ///
    /// # Errors
    /// `Mask` if `probability` is outside `[0, 1]`.
    pub fn mask_columns_by_probability<R: Rng>(&mut self, probability: f64, rng: &mut R) -> Result<()> {
        check_probability(probability)?;
        for m in &mut self.column {
            *m = rng.random::<f64>() < probability;
        }
        Ok(())
    }

    pub(crate) fn copy_layer_from(&mut self, layer: MaskLayer, source: &Mask) {
        match layer {
            MaskLayer::Element => self.element.clone_from(&source.element),
            MaskLayer::Row => self.row.clone_from(&source.row),
            MaskLayer::Column => self.column.clone_from(&source.column),
        }
    }

    pub(crate) fn clear_layer(&mut self, layer: MaskLayer) {
        match layer {
            MaskLayer::Element => self.clear_elements(),
            MaskLayer::Row => self.clear_rows(),
            MaskLayer::Column => self.clear_columns(),
        }
    }
}

fn check_probability(probability: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&probability) {
        return Err(ConvError::mask(format!(
            "masking probability must be within [0, 1], got {probability}"
        )));
    }
    Ok(())
}

/// Selects one of the three mask layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskLayer {
    /// Per-element layer.
    Element,
    /// Per-row layer.
    Row,
    /// Per-column layer.
    Column,
}

/// Index-based stacks over an arena of immutable mask snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct MaskStack {
    arena: Vec<Option<Arc<Mask>>>,
    element: Vec<usize>,
    row: Vec<usize>,
    column: Vec<usize>,
}

impl MaskStack {
    fn indices(&mut self, layer: MaskLayer) -> &mut Vec<usize> {
        match layer {
            MaskLayer::Element => &mut self.element,
            MaskLayer::Row => &mut self.row,
            MaskLayer::Column => &mut self.column,
        }
    }

    /// Records `snapshot` and pushes its arena index onto the `layer` stack.
    pub(crate) fn push(&mut self, layer: MaskLayer, snapshot: Option<Arc<Mask>>) {
        let index = self.arena.len();
        self.arena.push(snapshot);
        self.indices(layer).push(index);
    }

    /// Pops the most recent `layer` snapshot.
    pub(crate) fn pop(&mut self, layer: MaskLayer) -> Result<Option<Arc<Mask>>> {
        let index = self
            .indices(layer)
            .pop()
            .ok_or_else(|| ConvError::mask(format!("{layer:?} mask stack is empty")))?;
        let snapshot = self.arena[index].clone();
        if self.element.is_empty() && self.row.is_empty() && self.column.is_empty() {
            self.arena.clear();
        } else if index + 1 == self.arena.len() {
            self.arena.truncate(index);
        }
        Ok(snapshot)
    }

    pub(crate) fn len(&self, layer: MaskLayer) -> usize {
        match layer {
            MaskLayer::Element => self.element.len(),
            MaskLayer::Row => self.row.len(),
            MaskLayer::Column => self.column.len(),
        }
    }

    pub(crate) fn clear(&mut self, layer: MaskLayer) {
        self.indices(layer).clear();
        if self.element.is_empty() && self.row.is_empty() && self.column.is_empty() {
            self.arena.clear();
        }
    }
}
