//! Dataflow graph of tensor operations.
//!
//! A [`ComputeGraph`] is a DAG where nodes are operations and edges are
//! tensors flowing between them. Nodes are only ever appended, and a node
//! can only be appended once all of its inputs exist, so insertion order is
//! always a valid topological order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::shape::infer_shape;
use crate::types::{Scalar, TensorShape};

/// A unique identifier for a node in the computation graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

/// A unique identifier for an edge (tensor) in the computation graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeId(pub u32);

/// Where a constant buffer came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstantOrigin {
    /// Shared with a tensor from the weight file.
    Learned,
    /// Computed while assembling the graph (fused normalization, synthetic kernels).
    Derived,
}

/// An immutable f32 buffer referenced by operators.
#[derive(Clone, Debug)]
pub struct Constant {
    /// Unique name, used as the initializer name on export.
    pub name: String,
    /// Logical dimensions of the buffer.
    pub dims: Vec<u32>,
    /// Flat row-major payload.
    pub data: Arc<[f32]>,
    pub origin: ConstantOrigin,
}

impl Constant {
    /// A constant sharing a learned weight buffer.
    pub fn learned(name: impl Into<String>, dims: Vec<u32>, data: Arc<[f32]>) -> Self {
        Self {
            name: name.into(),
            dims,
            data,
            origin: ConstantOrigin::Learned,
        }
    }

    /// A constant owning a buffer computed during assembly.
    pub fn derived(name: impl Into<String>, dims: Vec<u32>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            dims,
            data: data.into(),
            origin: ConstantOrigin::Derived,
        }
    }

    /// Number of elements in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pointwise activation functions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    /// `ln(1 + e^x)`.
    Softplus,
    /// Hyperbolic tangent.
    Tanh,
    /// `x` for `x >= 0`, `alpha * x` otherwise.
    LeakyRelu { alpha: f32 },
}

/// Parameters shared by regular and transposed 2-D convolutions.
///
/// Kernels are square and stride/padding are symmetric.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvParams {
    pub out_channels: u32,
    pub kernel: u32,
    pub stride: u32,
    pub padding: u32,
    pub groups: u32,
    pub weight: Handle<Constant>,
    pub bias: Option<Handle<Constant>>,
}

/// Max pooling window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel: u32,
    pub stride: u32,
    pub padding: u32,
}

/// Configuration handed to the detection decode primitive.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeParams {
    pub grid_width: u32,
    pub grid_height: u32,
    pub num_anchors: u32,
    pub num_classes: u32,
    /// Ratio of input resolution to grid resolution.
    pub input_multiplier: u32,
    /// Flattened `(w, h)` pairs in input pixels.
    pub anchors: Vec<f32>,
    pub scale_xy: f32,
    /// Coordinate encoding version.
    pub new_coords: u32,
}

impl DecodeParams {
    /// Width of one decoded row: box (4) + objectness (1) + class scores.
    /// `None` if it does not fit a `u32`.
    pub fn row_width(&self) -> Option<u32> {
        self.num_classes.checked_add(5)
    }

    /// Number of decoded rows: one per grid cell and anchor.
    /// `None` if it does not fit a `u32`.
    pub fn rows(&self) -> Option<u32> {
        self.grid_width
            .checked_mul(self.grid_height)?
            .checked_mul(self.num_anchors)
    }
}

/// The operation type for a graph node.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphOp {
    /// 2-D convolution.
    Conv2d(ConvParams),
    /// 2-D transposed convolution.
    ConvTranspose2d(ConvParams),
    /// Per-channel `y = (scale * x + shift) ^ power`.
    ChannelAffine {
        scale: Handle<Constant>,
        shift: Handle<Constant>,
        power: Handle<Constant>,
    },
    /// Pointwise activation.
    Activation(Activation),
    /// Element-wise product.
    Mul,
    /// Element-wise sum.
    Add,
    /// Concatenation along an axis.
    Concat { axis: u32 },
    /// Max pooling 2D.
    MaxPool2d(PoolParams),
    /// Detection decode primitive producing one row per cell and anchor.
    DetectionDecode(DecodeParams),
}

impl GraphOp {
    /// Short operator name used in dumps and diagnostics.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Conv2d(_) => "Conv",
            Self::ConvTranspose2d(_) => "ConvTranspose",
            Self::ChannelAffine { .. } => "Scale",
            Self::Activation(Activation::Softplus) => "Softplus",
            Self::Activation(Activation::Tanh) => "Tanh",
            Self::Activation(Activation::LeakyRelu { .. }) => "LeakyRelu",
            Self::Mul => "Mul",
            Self::Add => "Add",
            Self::Concat { .. } => "Concat",
            Self::MaxPool2d(_) => "MaxPool",
            Self::DetectionDecode(_) => "YoloLayer",
        }
    }
}

/// Metadata about a tensor edge in the graph.
#[derive(Clone, Debug)]
pub struct TensorInfo {
    /// Human-readable name.
    pub name: String,
    /// Element scalar type.
    pub scalar: Scalar,
    pub shape: TensorShape,
}

/// A node in the computation graph.
#[derive(Clone, Debug)]
pub struct GraphNode {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// The operation this node performs.
    pub op: GraphOp,
    /// Input edge identifiers (ordered).
    pub inputs: Vec<EdgeId>,
    /// Output edge identifiers (ordered).
    pub outputs: Vec<EdgeId>,
    /// Human-readable name for this node.
    pub name: String,
}

/// The detector network as a dataflow graph.
#[derive(Clone, Debug, Default)]
pub struct ComputeGraph {
    /// Nodes in insertion order; `nodes[i].id == NodeId(i)`.
    pub nodes: Vec<GraphNode>,
    pub edges: HashMap<EdgeId, TensorInfo>,
    pub inputs: Vec<EdgeId>,
    pub outputs: Vec<EdgeId>,
    /// Buffers referenced by convolution and affine nodes.
    pub constants: Arena<Constant>,
    producers: HashMap<EdgeId, NodeId>,
    next_edge_id: u32,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor that no node produces yet.
    pub fn add_edge(&mut self, info: TensorInfo) -> EdgeId {
        let id = EdgeId(self.next_edge_id);
        self.next_edge_id += 1;
        self.edges.insert(id, info);
        id
    }

    /// Declare a graph input tensor.
    pub fn add_input(&mut self, name: impl Into<String>, scalar: Scalar, shape: TensorShape) -> EdgeId {
        let id = self.add_edge(TensorInfo {
            name: name.into(),
            scalar,
            shape,
        });
        self.inputs.push(id);
        id
    }

    pub fn add_constant(&mut self, constant: Constant) -> Handle<Constant> {
        self.constants.append(constant)
    }

    /// Append a node over already registered edges.
    ///
    /// Every edge must exist and each output may be produced only once.
    pub fn add_node(
        &mut self,
        op: GraphOp,
        inputs: Vec<EdgeId>,
        outputs: Vec<EdgeId>,
        name: impl Into<String>,
    ) -> Result<NodeId, IrError> {
        let name = name.into();
        if let Some(&edge) = inputs
            .iter()
            .chain(&outputs)
            .find(|e| !self.edges.contains_key(*e))
        {
            return Err(IrError::UnknownEdge { node: name, edge: edge.0 });
        }
        if let Some((edge, producer)) = outputs
            .iter()
            .find_map(|e| self.producers.get(e).map(|p| (*e, *p)))
        {
            return Err(IrError::Reproduced {
                node: name,
                edge: edge.0,
                producer: self.nodes[producer.0 as usize].name.clone(),
            });
        }

        let id = NodeId(self.nodes.len() as u32);
        for &out in &outputs {
            self.producers.insert(out, id);
        }
        self.nodes.push(GraphNode {
            id,
            op,
            inputs,
            outputs,
            name,
        });
        Ok(id)
    }

    /// Infer the output shape of `op` and append it as a node with a single
    /// output edge named after the node.
    ///
    /// Nothing is inserted when shape inference fails.
    pub fn add_op(&mut self, op: GraphOp, inputs: &[EdgeId], name: impl Into<String>) -> Result<EdgeId, IrError> {
        let name = name.into();
        let mut shapes = Vec::with_capacity(inputs.len());
        for e in inputs {
            let info = self.edges.get(e).ok_or_else(|| IrError::UnknownEdge {
                node: name.clone(),
                edge: e.0,
            })?;
            shapes.push(&info.shape);
        }
        let shape = infer_shape(&op, &shapes, &self.constants, &name)?;
        let scalar = inputs
            .first()
            .and_then(|e| self.edges.get(e))
            .map_or(Scalar::F32, |info| info.scalar);

        log::trace!("{name}: {} -> {shape}", op.op_name());

        let out = self.add_edge(TensorInfo {
            name: name.clone(),
            scalar,
            shape,
        });
        self.add_node(op, inputs.to_vec(), vec![out], name)?;
        Ok(out)
    }

    /// Metadata of an edge.
    ///
    /// # Panics
    ///
    /// If `edge` did not come from this graph.
    pub fn tensor(&self, edge: EdgeId) -> &TensorInfo {
        match self.edges.get(&edge) {
            Some(info) => info,
            None => panic!("edge %{} does not belong to this graph", edge.0),
        }
    }

    pub fn shape(&self, edge: EdgeId) -> &TensorShape {
        &self.tensor(edge).shape
    }

    /// Rename an edge and declare it a graph output.
    pub fn mark_output(&mut self, edge: EdgeId, name: impl Into<String>) {
        if let Some(info) = self.edges.get_mut(&edge) {
            info.name = name.into();
        }
        self.outputs.push(edge);
    }

    /// The finished network has exactly one input and one output.
    pub fn validate_interface(&self) -> Result<(), IrError> {
        if self.inputs.len() != 1 || self.outputs.len() != 1 {
            return Err(IrError::Interface {
                inputs: self.inputs.len(),
                outputs: self.outputs.len(),
            });
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total size of all constant buffers in bytes.
    pub fn constant_bytes(&self) -> usize {
        self.constants
            .iter()
            .map(|(_, c)| c.len() * std::mem::size_of::<f32>())
            .sum()
    }

    /// The node producing `edge`; `None` for graph inputs.
    pub fn edge_producer(&self, edge: EdgeId) -> Option<&GraphNode> {
        let id = self.producers.get(&edge)?;
        self.nodes.get(id.0 as usize)
    }

    /// Nodes ordered so that every producer precedes its consumers.
    ///
    /// Among ready nodes the one inserted first goes first, so graphs built
    /// through [`add_op`](Self::add_op) come back in insertion order.
    pub fn topological_order(&self) -> Result<Vec<&GraphNode>, IrError> {
        let n = self.nodes.len();
        let mut pending = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(p) = self.producers.get(input) {
                    pending[i] += 1;
                    consumers[p.0 as usize].push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| pending[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(&self.nodes[i]);
            for &c in &consumers[i] {
                pending[c] -= 1;
                if pending[c] == 0 {
                    ready.push(Reverse(c));
                }
            }
        }

        if order.len() != n {
            return Err(IrError::Cycle {
                ordered: order.len(),
                total: n,
            });
        }
        Ok(order)
    }
}
