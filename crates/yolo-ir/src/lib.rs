//! Graph intermediate representation for the detector build.
//!
//! A static, batch-less dataflow graph: typed tensor edges, operator nodes,
//! and an arena of constant buffers. Shapes are inferred on insertion so
//! that every topology error surfaces while the graph is being built.

pub mod arena;
mod display;
mod error;
pub mod graph;
pub mod shape;
mod types;

pub use arena::{Arena, Handle};
pub use display::dump_graph;
pub use error::IrError;
pub use graph::{
    Activation, ComputeGraph, Constant, ConstantOrigin, ConvParams, DecodeParams, EdgeId,
    GraphNode, GraphOp, NodeId, PoolParams, TensorInfo,
};
pub use types::{Scalar, TensorShape};
