//! Recording computation graphs and reverse-mode replay.
//!
//! A [`ComputationGraph`] is an explicit builder context: operations that
//! should be differentiable are issued through it rather than on [`Matrix`]
//! directly. Each call evaluates the operation, appends a [`Node`] and tags the
//! result with the graph's [`GraphId`].
//!
//! Matrices that carry no tag (weights, freshly loaded samples) are leaves and
//! may take part in any number of graphs. A matrix tagged by one graph may not
//! be fed into another: mixing them fails with
//! [`ConvError::GraphConflict`] instead of silently merging provenance.
//!
//! Sliding-window operators are recorded as opaque nodes that keep the
//! operator and the trace of its forward pass, so [`ComputationGraph::backward`]
//! can call their hand-written gradient dual.
//!
//! # Example
//! ```rust
//! use briny_conv::graph::ComputationGraph;
//! use briny_conv::matrix;
//!
//! let a = matrix!([[1.0, 2.0], [3.0, 4.0]]);
//! let b = matrix!([[0.5, 0.5], [0.5, 0.5]]);
//!
//! let mut graph = ComputationGraph::new();
//! let c = graph.multiply(&a, &b).unwrap();
//! let loss = graph.sum(&c).unwrap();
//!
//! let grads = graph.backward(&loss, &matrix!([[1.0]])).unwrap();
//! assert_eq!(grads.get(&a).unwrap().values(), vec![0.5; 4]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use crate::error::{ConvError, Result};
use crate::matrix::{Matrix, MatrixId};
use crate::ops::{SlidingWindowOperator, WindowKind, WindowTrace};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Elementwise function paired with its derivative.
#[derive(Debug, Clone, Copy)]
pub struct UnaryFunction {
    pub name: &'static str,
    pub function: fn(f64) -> f64,
    /// Derivative with respect to the function's input.
    pub derivative: fn(f64) -> f64,
}

impl UnaryFunction {
    pub const IDENTITY: Self = Self::new("identity", |x| x, |_| 1.0);
    pub const RELU: Self = Self::new("relu", |x| x.max(0.0), |x| if x > 0.0 { 1.0 } else { 0.0 });
    pub const SIGMOID: Self = Self::new("sigmoid", sigmoid, |x| {
        let s = sigmoid(x);
        s * (1.0 - s)
    });
    pub const TANH: Self = Self::new("tanh", f64::tanh, |x| 1.0 - x.tanh().powi(2));

    pub const fn new(name: &'static str, function: fn(f64) -> f64, derivative: fn(f64) -> f64) -> Self {
        Self {
            name,
            function,
            derivative,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Kind of a recorded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Dot,
    /// Elementwise function, by name.
    Unary(&'static str),
    Sum,
    Mean,
    /// Opaque sliding-window operator.
    Window(WindowKind),
}

#[derive(Debug, Clone)]
enum Replay {
    Binary(Matrix, Matrix),
    Unary(Matrix, UnaryFunction),
    Reduce(Matrix),
    Window {
        operator: Arc<dyn SlidingWindowOperator>,
        trace: WindowTrace,
    },
}

/// One recorded expression: operands, operation and result.
#[derive(Debug, Clone)]
pub struct Node {
    operation: Operation,
    operands: Vec<MatrixId>,
    result: MatrixId,
    replay: Replay,
}

impl Node {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn operands(&self) -> &[MatrixId] {
        &self.operands
    }

    pub fn result(&self) -> MatrixId {
        self.result
    }
}

/// Append-only recorder of differentiable operations.
#[derive(Debug)]
pub struct ComputationGraph {
    id: GraphId,
    nodes: Vec<Node>,
}

impl Default for ComputationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self {
            id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: Vec::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Recorded nodes in evaluation order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tags `matrix` as produced inside this graph.
    ///
    /// # Errors
    /// `GraphConflict` if it already belongs to another graph.
    pub fn attach(&self, matrix: &mut Matrix) -> Result<()> {
        self.check(&[&*matrix])?;
        matrix.set_graph(self.id);
        Ok(())
    }

    fn check(&self, operands: &[&Matrix]) -> Result<()> {
        let mut seen: Option<GraphId> = None;
        for graph in operands.iter().filter_map(|m| m.graph()) {
            match seen {
                Some(first) if first != graph => {
                    return Err(ConvError::GraphConflict { first, second: graph });
                }
                _ => seen = Some(graph),
            }
        }
        match seen {
            Some(first) if first != self.id => Err(ConvError::GraphConflict {
                first,
                second: self.id,
            }),
            _ => Ok(()),
        }
    }

    fn record(&mut self, operation: Operation, operands: &[&Matrix], mut result: Matrix, replay: Replay) -> Matrix {
        result.set_graph(self.id);
        let operands: Vec<MatrixId> = operands.iter().map(|m| m.id()).collect();
        trace!(
            "{}: node {} {:?} {:?} -> {}",
            self.id,
            self.nodes.len(),
            operation,
            operands,
            result.id()
        );
        self.nodes.push(Node {
            operation,
            operands,
            result: result.id(),
            replay,
        });
        result
    }

    fn binary(
        &mut self,
        operation: Operation,
        a: &Matrix,
        b: &Matrix,
        eval: fn(&Matrix, &Matrix) -> Result<Matrix>,
    ) -> Result<Matrix> {
        self.check(&[a, b])?;
        let out = eval(a, b)?;
        Ok(self.record(operation, &[a, b], out, Replay::Binary(a.clone(), b.clone())))
    }

    /// Records `a + b`.
    ///
    /// # Errors
    /// `GraphConflict` or `Shape`.
    pub fn add(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.binary(Operation::Add, a, b, Matrix::add)
    }

    /// Records `a - b`.
    ///
    /// # Errors
    /// `GraphConflict` or `Shape`.
    pub fn subtract(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.binary(Operation::Subtract, a, b, Matrix::subtract)
    }

    /// Records the elementwise product.
    ///
    /// # Errors
    /// `GraphConflict` or `Shape`.
    pub fn multiply(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.binary(Operation::Multiply, a, b, Matrix::multiply)
    }

    /// Records the elementwise quotient.
    ///
    /// # Errors
    /// `GraphConflict` or `Shape`.
    pub fn divide(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.binary(Operation::Divide, a, b, Matrix::divide)
    }

    /// Records the matrix product.
    ///
    /// # Errors
    /// `GraphConflict` or `Shape`.
    pub fn dot(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.binary(Operation::Dot, a, b, Matrix::dot)
    }

    /// Records an elementwise function.
    ///
    /// # Errors
    /// `GraphConflict`.
    pub fn apply(&mut self, a: &Matrix, function: UnaryFunction) -> Result<Matrix> {
        self.check(&[a])?;
        let out = a.apply(function.function);
        Ok(self.record(Operation::Unary(function.name), &[a], out, Replay::Unary(a.clone(), function)))
    }

    /// Records the sum of unmasked elements as a 1x1 matrix.
    ///
    /// # Errors
    /// `GraphConflict`.
    pub fn sum(&mut self, a: &Matrix) -> Result<Matrix> {
        self.check(&[a])?;
        let out = Matrix::constant(1, 1, a.sum());
        Ok(self.record(Operation::Sum, &[a], out, Replay::Reduce(a.clone())))
    }

    /// Records the mean of unmasked elements as a 1x1 matrix.
    ///
    /// # Errors
    /// `GraphConflict`.
    pub fn mean(&mut self, a: &Matrix) -> Result<Matrix> {
        self.check(&[a])?;
        let out = Matrix::constant(1, 1, a.mean());
        Ok(self.record(Operation::Mean, &[a], out, Replay::Reduce(a.clone())))
    }

    /// Runs a sliding-window operator and records it as one opaque node.
    ///
    /// # Errors
    /// `GraphConflict`, or whatever the operator's forward pass raises.
    pub fn window(
        &mut self,
        operator: &Arc<dyn SlidingWindowOperator>,
        input: &Matrix,
        filter: Option<&Matrix>,
    ) -> Result<Matrix> {
        let mut operands = vec![input];
        operands.extend(filter);
        self.check(&operands)?;
        let pass = operator.forward(input, filter)?;
        let replay = Replay::Window {
            operator: Arc::clone(operator),
            trace: pass.trace,
        };
        Ok(self.record(Operation::Window(operator.kind()), &operands, pass.output, replay))
    }

    /// Propagates `seed` from `output` back through every recorded node.
    ///
    /// Gradients reaching the same matrix along several paths are summed.
    /// Masked positions receive no gradient.
    ///
    /// # Errors
    /// `Shape` if `seed` does not match `output`, or if a gradient dual rejects
    /// its upstream gradient.
    pub fn backward(&self, output: &Matrix, seed: &Matrix) -> Result<Gradients> {
        output.ensure_equal_size(seed, "gradient seed")?;
        let mut grads = Gradients::default();
        grads.accumulate(output.id(), seed.to_dense())?;

        for node in self.nodes.iter().rev() {
            let Some(g) = grads.map.get(&node.result).cloned() else {
                continue;
            };
            match &node.replay {
                Replay::Binary(a, b) => {
                    let (da, db) = binary_gradient(node.operation, a, b, &g)?;
                    grads.accumulate(a.id(), da)?;
                    grads.accumulate(b.id(), db)?;
                }
                Replay::Unary(a, function) => {
                    let da = g.multiply(&a.apply(function.derivative))?;
                    grads.accumulate(a.id(), da)?;
                }
                Replay::Reduce(a) => {
                    let scale = match node.operation {
                        Operation::Mean => 1.0 / a.count_unmasked().max(1) as f64,
                        _ => 1.0,
                    };
                    let upstream = g.get(0, 0) * scale;
                    grads.accumulate(a.id(), broadcast(a, upstream))?;
                }
                Replay::Window { operator, trace } => {
                    let dual = operator.gradient(&g, trace)?;
                    grads.accumulate(node.operands[0], dual.input)?;
                    if let (Some(df), Some(&filter)) = (dual.filter, node.operands.get(1)) {
                        grads.accumulate(filter, df)?;
                    }
                }
            }
        }
        Ok(grads)
    }
}

fn binary_gradient(operation: Operation, a: &Matrix, b: &Matrix, g: &Matrix) -> Result<(Matrix, Matrix)> {
    let k = a.scaling();
    let (da, db) = match operation {
        Operation::Add => (g.clone(), g.clone()),
        Operation::Subtract => (g.clone(), g.multiply_constant(-1.0)),
        Operation::Multiply => (g.multiply(b)?, g.multiply(a)?),
        Operation::Divide => {
            let da = g.divide(b)?;
            let db = g.multiply(a)?.divide(&b.multiply(b)?)?.multiply_constant(-1.0);
            (da, db)
        }
        Operation::Dot => {
            let da = zero_masked(g.dot(&b.transpose())?, a);
            let mut at = a.transpose();
            at.unset_scaling_constant();
            let db = zero_masked(at.dot(g)?, b);
            (da, db)
        }
        _ => unreachable!("{operation:?} is not a binary operation"),
    };
    Ok((da.multiply_constant(k), db.multiply_constant(k)))
}

fn broadcast(like: &Matrix, value: f64) -> Matrix {
    let mut out = like.zeros_like();
    for r in 0..out.rows() {
        for c in 0..out.columns() {
            if !like.is_masked(r, c) {
                out.set(r, c, value);
            }
        }
    }
    out
}

fn zero_masked(mut grad: Matrix, like: &Matrix) -> Matrix {
    if like.has_mask() {
        for r in 0..grad.rows() {
            for c in 0..grad.columns() {
                if like.is_masked(r, c) {
                    grad.set(r, c, 0.0);
                }
            }
        }
    }
    grad
}

/// Gradients produced by [`ComputationGraph::backward`], keyed by matrix identity.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    map: HashMap<MatrixId, Matrix>,
}

impl Gradients {
    /// Gradient with respect to `matrix`, if it took part in the graph.
    pub fn get(&self, matrix: &Matrix) -> Option<&Matrix> {
        self.map.get(&matrix.id())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MatrixId, &Matrix)> {
        self.map.iter()
    }

    fn accumulate(&mut self, id: MatrixId, mut grad: Matrix) -> Result<()> {
        grad.unset_mask();
        grad.unset_scaling_constant();
        match self.map.get_mut(&id) {
            Some(existing) => *existing = existing.add(&grad)?,
            None => {
                self.map.insert(id, grad);
            }
        }
        Ok(())
    }
}
