//! Error types for the graph IR.

use crate::types::TensorShape;

/// Errors raised while building or walking a [`ComputeGraph`](crate::ComputeGraph).
///
/// Insertion errors leave the graph unchanged.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// Two operands that must agree in shape do not.
    #[error("node '{node}': shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        node: String,
        expected: TensorShape,
        found: TensorShape,
    },

    /// The operator received the wrong number of inputs.
    #[error("node '{node}': expected {expected} input(s), got {found}")]
    Arity {
        node: String,
        expected: usize,
        found: usize,
    },

    /// Window, stride, channel or grid parameters are inconsistent with the input.
    #[error("node '{node}': {reason}")]
    InvalidGeometry { node: String, reason: String },

    /// A constant handle passed to an operator does not exist in the graph.
    #[error("node '{node}': constant {index} out of bounds (arena size: {size})")]
    BadConstant {
        node: String,
        index: usize,
        size: usize,
    },

    /// A node refers to an edge the graph never registered.
    #[error("node '{node}': edge %{edge} is not part of the graph")]
    UnknownEdge { node: String, edge: u32 },

    /// A second node claims an edge that already has a producer.
    #[error("node '{node}': edge %{edge} is already produced by '{producer}'")]
    Reproduced {
        node: String,
        edge: u32,
        producer: String,
    },

    /// Nodes that depend on each other in a loop.
    #[error("graph contains a cycle ({ordered} of {total} nodes could be ordered)")]
    Cycle { ordered: usize, total: usize },

    /// The graph does not declare exactly one input and one named output.
    #[error("graph must declare exactly one input and one output (found {inputs} and {outputs})")]
    Interface { inputs: usize, outputs: usize },
}
