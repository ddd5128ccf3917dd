//! Pooling operators.
//!
//! None of these flip or weight the window. Max, cyclic and random pooling
//! select one input element per output position and route the whole upstream
//! gradient back to it. Average pooling spreads the upstream gradient evenly
//! over the window's unmasked elements.
//!
//! A window whose taps are all masked yields `0` and receives no gradient.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    SlidingWindowOperator, WindowGradient, WindowKind, WindowPass, WindowTrace, check_upstream, tap,
    trace_mismatch,
};
use crate::error::{ConvError, Result};
use crate::geometry::FilterGeometry;
use crate::matrix::Matrix;
use crate::matrix::mask::Mask;

fn reject_filter(kind: WindowKind, filter: Option<&Matrix>) -> Result<()> {
    if filter.is_some() {
        return Err(ConvError::shape(format!("{kind:?} takes no filter")));
    }
    Ok(())
}

/// Unmasked input positions of the window at output `(r, c)`, row-major.
fn unmasked_taps(geometry: &FilterGeometry, input: &Matrix, r: usize, c: usize) -> Vec<(usize, usize)> {
    let mut taps = Vec::with_capacity(geometry.taps());
    for i in 0..geometry.filter_rows() {
        for j in 0..geometry.filter_columns() {
            let (ir, ic) = tap(geometry, r, c, i, j);
            if !input.is_masked(ir, ic) {
                taps.push((ir, ic));
            }
        }
    }
    taps
}

/// Shared forward pass of the selecting pools.
fn routed_forward(
    geometry: &FilterGeometry,
    input: &Matrix,
    mut select: impl FnMut(usize, usize) -> Option<(usize, usize)>,
) -> Result<WindowPass> {
    let (rows, columns) = geometry.output_size(input.rows(), input.columns())?;
    let mut output = Matrix::new(rows, columns);
    let mut routes = Vec::with_capacity(rows * columns);
    for r in 0..rows {
        for c in 0..columns {
            let route = select(r, c);
            if let Some((ir, ic)) = route {
                output.set(r, c, input.scaling() * input.get(ir, ic));
            }
            routes.push(route);
        }
    }
    Ok(WindowPass {
        output,
        trace: WindowTrace::Routed {
            rows: input.rows(),
            columns: input.columns(),
            scaling: input.scaling(),
            routes,
        },
    })
}

/// Shared gradient of the selecting pools.
fn routed_gradient(
    geometry: &FilterGeometry,
    kind: WindowKind,
    upstream: &Matrix,
    trace: &WindowTrace,
) -> Result<WindowGradient> {
    let WindowTrace::Routed {
        rows,
        columns,
        scaling,
        routes,
    } = trace
    else {
        return Err(trace_mismatch(kind));
    };
    let (out_rows, out_columns) = geometry.output_size(*rows, *columns)?;
    check_upstream(upstream, out_rows, out_columns)?;

    let mut d_input = Matrix::new(*rows, *columns);
    for (index, route) in routes.iter().enumerate() {
        let (r, c) = (index / out_columns, index % out_columns);
        if let Some((ir, ic)) = *route
            && !upstream.is_masked(r, c)
        {
            d_input.increment(ir, ic, scaling * upstream.get(r, c));
        }
    }
    Ok(WindowGradient {
        input: d_input,
        filter: None,
    })
}

/// Selects the window maximum; ties go to the first element in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool {
    geometry: FilterGeometry,
}

impl MaxPool {
    pub fn new(geometry: FilterGeometry) -> Self {
        Self { geometry }
    }
}

impl SlidingWindowOperator for MaxPool {
    fn kind(&self) -> WindowKind {
        WindowKind::MaxPool
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        reject_filter(self.kind(), filter)?;
        routed_forward(&self.geometry, input, |r, c| {
            let mut best: Option<(f64, (usize, usize))> = None;
            for (ir, ic) in unmasked_taps(&self.geometry, input, r, c) {
                let value = input.get(ir, ic);
                match best {
                    Some((max, _)) if value <= max => {}
                    _ => best = Some((value, (ir, ic))),
                }
            }
            best.map(|(_, position)| position)
        })
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        routed_gradient(&self.geometry, self.kind(), upstream, trace)
    }
}

/// Mean over the window's unmasked elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AveragePool {
    geometry: FilterGeometry,
}

impl AveragePool {
    pub fn new(geometry: FilterGeometry) -> Self {
        Self { geometry }
    }
}

impl SlidingWindowOperator for AveragePool {
    fn kind(&self) -> WindowKind {
        WindowKind::AveragePool
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        reject_filter(self.kind(), filter)?;
        let (rows, columns) = self.geometry.output_size(input.rows(), input.columns())?;
        let mut output = Matrix::new(rows, columns);
        for r in 0..rows {
            for c in 0..columns {
                let taps = unmasked_taps(&self.geometry, input, r, c);
                if taps.is_empty() {
                    continue;
                }
                let sum: f64 = taps.iter().map(|&(ir, ic)| input.get(ir, ic)).sum();
                output.set(r, c, input.scaling() * sum / taps.len() as f64);
            }
        }
        Ok(WindowPass {
            output,
            trace: WindowTrace::Averaged {
                rows: input.rows(),
                columns: input.columns(),
                scaling: input.scaling(),
                mask: input.cropped_mask(),
            },
        })
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        let WindowTrace::Averaged {
            rows,
            columns,
            scaling,
            mask,
        } = trace
        else {
            return Err(trace_mismatch(self.kind()));
        };
        let (out_rows, out_columns) = self.geometry.output_size(*rows, *columns)?;
        check_upstream(upstream, out_rows, out_columns)?;

        let mut shape = Matrix::new(*rows, *columns);
        if let Some(mask) = mask {
            shape.set_mask_with(Mask::clone(mask))?;
        }
        let mut d_input = Matrix::new(*rows, *columns);
        for r in 0..out_rows {
            for c in 0..out_columns {
                if upstream.is_masked(r, c) {
                    continue;
                }
                let taps = unmasked_taps(&self.geometry, &shape, r, c);
                if taps.is_empty() {
                    continue;
                }
                let share = scaling * upstream.get(r, c) / taps.len() as f64;
                for (ir, ic) in taps {
                    d_input.increment(ir, ic, share);
                }
            }
        }
        Ok(WindowGradient {
            input: d_input,
            filter: None,
        })
    }
}

/// Selects window offsets in a fixed cycle instead of by value.
///
/// A cursor over the filter offsets restarts at `(0, 0)` on every forward
/// pass and advances once per output position in row-major output order, the
/// row offset fastest. Masked offsets are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicPool {
    geometry: FilterGeometry,
}

impl CyclicPool {
    pub fn new(geometry: FilterGeometry) -> Self {
        Self { geometry }
    }
}

impl SlidingWindowOperator for CyclicPool {
    fn kind(&self) -> WindowKind {
        WindowKind::CyclicPool
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        reject_filter(self.kind(), filter)?;
        let geometry = self.geometry;
        let mut cursor = (0, 0);
        routed_forward(&geometry, input, |r, c| {
            for _ in 0..geometry.taps() {
                let (i, j) = cursor;
                cursor.0 += 1;
                if cursor.0 == geometry.filter_rows() {
                    cursor.0 = 0;
                    cursor.1 = (cursor.1 + 1) % geometry.filter_columns();
                }
                let (ir, ic) = tap(&geometry, r, c, i, j);
                if !input.is_masked(ir, ic) {
                    return Some((ir, ic));
                }
            }
            None
        })
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        routed_gradient(&self.geometry, self.kind(), upstream, trace)
    }
}

/// Selects one unmasked window element uniformly at random.
#[derive(Debug)]
pub struct RandomPool {
    geometry: FilterGeometry,
    rng: Mutex<StdRng>,
}

impl RandomPool {
    /// Seeded from the operating system.
    pub fn new(geometry: FilterGeometry) -> Self {
        Self {
            geometry,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Reproducible selection sequence.
    pub fn with_seed(geometry: FilterGeometry, seed: u64) -> Self {
        Self {
            geometry,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SlidingWindowOperator for RandomPool {
    fn kind(&self) -> WindowKind {
        WindowKind::RandomPool
    }

    fn geometry(&self) -> FilterGeometry {
        self.geometry
    }

    fn forward(&self, input: &Matrix, filter: Option<&Matrix>) -> Result<WindowPass> {
        reject_filter(self.kind(), filter)?;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        routed_forward(&self.geometry, input, |r, c| {
            let taps = unmasked_taps(&self.geometry, input, r, c);
            if taps.is_empty() {
                None
            } else {
                Some(taps[rng.random_range(0..taps.len())])
            }
        })
    }

    fn gradient(&self, upstream: &Matrix, trace: &WindowTrace) -> Result<WindowGradient> {
        routed_gradient(&self.geometry, self.kind(), upstream, trace)
    }
}
