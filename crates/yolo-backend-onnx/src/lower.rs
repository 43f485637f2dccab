//! ONNX graph construction from a [`ComputeGraph`].
//!
//! The IR is batch-less; every tensor gains a leading batch dimension of 1
//! and concatenation axes shift by one accordingly.

use std::collections::{HashMap, HashSet};

use yolo_backend_core::{BackendError, BackendOptions, Precision};
use yolo_ir::{
    Activation, ComputeGraph, Constant, ConvParams, DecodeParams, EdgeId, GraphNode, GraphOp,
    Handle, PoolParams, TensorShape,
};

use crate::proto::*;

pub(crate) const IR_VERSION: i64 = 7;
pub(crate) const OPSET_VERSION: i64 = 13;
pub(crate) const PLUGIN_DOMAIN: &str = "trt.plugins";
pub(crate) const DECODE_OP: &str = "YoloLayer_TRT";

/// Build an ONNX model from a finished graph.
pub fn build_model(graph: &ComputeGraph, opts: &BackendOptions) -> Result<ModelProto, BackendError> {
    if graph.inputs.is_empty() || graph.outputs.is_empty() {
        return Err(BackendError::InvalidGraph(format!(
            "graph declares {} input(s) and {} output(s)",
            graph.inputs.len(),
            graph.outputs.len()
        )));
    }

    let mut lowering = Lowering::new(graph)?;
    let order = graph
        .topological_order()
        .map_err(|e| BackendError::InvalidGraph(e.to_string()))?;
    for node in order {
        lowering.lower_node(node)?;
    }

    let input = graph
        .inputs
        .iter()
        .map(|&e| lowering.value_info(e))
        .collect();
    let output = graph
        .outputs
        .iter()
        .map(|&e| lowering.value_info(e))
        .collect();

    let mut opset_import = vec![OperatorSetIdProto {
        domain: String::new(),
        version: OPSET_VERSION,
    }];
    if lowering.uses_plugin {
        opset_import.push(OperatorSetIdProto {
            domain: PLUGIN_DOMAIN.into(),
            version: 1,
        });
    }

    let mut metadata_props = vec![
        entry("precision", opts.precision.tag()),
        entry("max_batch_size", &opts.max_batch_size.to_string()),
        entry("workspace_bytes", &opts.workspace_bytes.to_string()),
    ];
    if opts.precision == Precision::Reduced {
        metadata_props.push(entry("fp16", "1"));
    }

    Ok(ModelProto {
        ir_version: IR_VERSION,
        producer_name: "yolo-build".into(),
        producer_version: env!("CARGO_PKG_VERSION").into(),
        graph: Some(GraphProto {
            node: lowering.nodes,
            name: "yolov4".into(),
            initializer: lowering.initializers,
            input,
            output,
        }),
        opset_import,
        metadata_props,
    })
}

fn entry(key: &str, value: &str) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.into(),
        value: value.into(),
    }
}

/// Prepend the batch dimension.
fn batched(shape: &TensorShape) -> Vec<i64> {
    std::iter::once(1)
        .chain(shape.dims.iter().map(|&d| i64::from(d)))
        .collect()
}

fn window_attrs(kernel: u32, stride: u32, padding: u32) -> Vec<AttributeProto> {
    let (k, s, p) = (i64::from(kernel), i64::from(stride), i64::from(padding));
    vec![
        AttributeProto::ints("kernel_shape", vec![k, k]),
        AttributeProto::ints("strides", vec![s, s]),
        AttributeProto::ints("pads", vec![p, p, p, p]),
    ]
}

struct Lowering<'g> {
    graph: &'g ComputeGraph,
    names: HashMap<EdgeId, String>,
    emitted: HashSet<Handle<Constant>>,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    uses_plugin: bool,
}

impl<'g> Lowering<'g> {
    fn new(graph: &'g ComputeGraph) -> Result<Self, BackendError> {
        // Tensor names must be unique across edges and initializers.
        let mut seen: HashSet<&str> = graph.constants.iter().map(|(_, c)| c.name.as_str()).collect();
        if seen.len() != graph.constants.len() {
            return Err(BackendError::InvalidGraph("duplicate constant names".into()));
        }
        let mut names = HashMap::new();
        let mut edges: Vec<_> = graph.edges.iter().collect();
        edges.sort_by_key(|(id, _)| **id);
        for (id, info) in edges {
            if !seen.insert(&info.name) {
                return Err(BackendError::InvalidGraph(format!(
                    "tensor name '{}' is used more than once",
                    info.name
                )));
            }
            names.insert(*id, info.name.clone());
        }

        Ok(Self {
            graph,
            names,
            emitted: HashSet::new(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            uses_plugin: false,
        })
    }

    fn name(&self, edge: EdgeId) -> String {
        self.names.get(&edge).cloned().unwrap_or_default()
    }

    fn value_info(&self, edge: EdgeId) -> ValueInfoProto {
        let dims = batched(self.graph.shape(edge))
            .into_iter()
            .map(TensorShapeDimension::fixed)
            .collect();
        ValueInfoProto::tensor(self.name(edge), data_type::FLOAT, dims)
    }

    /// Emit a constant as an initializer with the given dims, once.
    fn initializer(&mut self, handle: Handle<Constant>, dims: Vec<i64>) -> Result<String, BackendError> {
        let graph = self.graph;
        let constant = graph.constants.try_get(handle).ok_or_else(|| {
            BackendError::InvalidGraph(format!("constant {} does not exist", handle.index()))
        })?;
        if self.emitted.insert(handle) {
            self.initializers
                .push(TensorProto::float(&constant.name, dims, &constant.data));
        }
        Ok(constant.name.clone())
    }

    fn constant_dims(&self, handle: Handle<Constant>) -> Vec<i64> {
        self.graph
            .constants
            .try_get(handle)
            .map(|c| c.dims.iter().map(|&d| i64::from(d)).collect())
            .unwrap_or_default()
    }

    fn lower_node(&mut self, node: &GraphNode) -> Result<(), BackendError> {
        let inputs: Vec<String> = node.inputs.iter().map(|&e| self.name(e)).collect();
        let outputs: Vec<String> = node.outputs.iter().map(|&e| self.name(e)).collect();

        match &node.op {
            GraphOp::Conv2d(p) => self.lower_conv("Conv", p, node, inputs, outputs)?,
            GraphOp::ConvTranspose2d(p) => {
                self.lower_conv("ConvTranspose", p, node, inputs, outputs)?
            }
            GraphOp::ChannelAffine { scale, shift, power } => {
                self.lower_affine(node, [*scale, *shift, *power], inputs, outputs)?
            }
            GraphOp::Activation(act) => {
                let proto = match act {
                    Activation::Softplus => NodeProto::simple("Softplus", &node.name, inputs, outputs),
                    Activation::Tanh => NodeProto::simple("Tanh", &node.name, inputs, outputs),
                    Activation::LeakyRelu { alpha } => NodeProto::with_attrs(
                        "LeakyRelu",
                        &node.name,
                        inputs,
                        outputs,
                        vec![AttributeProto::float("alpha", *alpha)],
                    ),
                };
                self.nodes.push(proto);
            }
            GraphOp::Mul => self
                .nodes
                .push(NodeProto::simple("Mul", &node.name, inputs, outputs)),
            GraphOp::Add => self
                .nodes
                .push(NodeProto::simple("Add", &node.name, inputs, outputs)),
            GraphOp::Concat { axis } => self.nodes.push(NodeProto::with_attrs(
                "Concat",
                &node.name,
                inputs,
                outputs,
                vec![AttributeProto::int("axis", i64::from(*axis) + 1)],
            )),
            GraphOp::MaxPool2d(PoolParams {
                kernel,
                stride,
                padding,
            }) => self.nodes.push(NodeProto::with_attrs(
                "MaxPool",
                &node.name,
                inputs,
                outputs,
                window_attrs(*kernel, *stride, *padding),
            )),
            GraphOp::DetectionDecode(p) => {
                self.uses_plugin = true;
                self.nodes.push(decode_node(p, &node.name, inputs, outputs));
            }
        }
        Ok(())
    }

    fn lower_conv(
        &mut self,
        op_type: &str,
        p: &ConvParams,
        node: &GraphNode,
        mut inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<(), BackendError> {
        let weight_dims = self.constant_dims(p.weight);
        inputs.push(self.initializer(p.weight, weight_dims)?);
        if let Some(bias) = p.bias {
            inputs.push(self.initializer(bias, vec![i64::from(p.out_channels)])?);
        }
        let mut attrs = window_attrs(p.kernel, p.stride, p.padding);
        attrs.push(AttributeProto::int("group", i64::from(p.groups)));
        self.nodes
            .push(NodeProto::with_attrs(op_type, &node.name, inputs, outputs, attrs));
        Ok(())
    }

    /// `scale * x + shift`; the exponent is only emitted when it is not 1.
    fn lower_affine(
        &mut self,
        node: &GraphNode,
        [scale, shift, power]: [Handle<Constant>; 3],
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<(), BackendError> {
        let channels = i64::from(self.graph.shape(node.inputs[0]).channels());
        let broadcast = vec![channels, 1, 1];
        let unit_power = self
            .graph
            .constants
            .try_get(power)
            .is_some_and(|c| c.data.iter().all(|&v| v == 1.0));

        let scale = self.initializer(scale, broadcast.clone())?;
        let shift = self.initializer(shift, broadcast.clone())?;
        let scaled = format!("{}.scaled", node.name);
        let shifted = if unit_power {
            outputs
        } else {
            vec![format!("{}.shifted", node.name)]
        };

        self.nodes.push(NodeProto::simple(
            "Mul",
            format!("{}.mul", node.name),
            vec![inputs[0].clone(), scale],
            vec![scaled.clone()],
        ));
        self.nodes.push(NodeProto::simple(
            "Add",
            format!("{}.add", node.name),
            vec![scaled, shift],
            shifted.clone(),
        ));
        if !unit_power {
            let power = self.initializer(power, broadcast)?;
            let output = self.name(node.outputs[0]);
            self.nodes.push(NodeProto::simple(
                "Pow",
                format!("{}.pow", node.name),
                vec![shifted[0].clone(), power],
                vec![output],
            ));
        }
        Ok(())
    }
}

fn decode_node(p: &DecodeParams, name: &str, inputs: Vec<String>, outputs: Vec<String>) -> NodeProto {
    let mut proto = NodeProto::with_attrs(
        DECODE_OP,
        name,
        inputs,
        outputs,
        vec![
            AttributeProto::int("yoloWidth", i64::from(p.grid_width)),
            AttributeProto::int("yoloHeight", i64::from(p.grid_height)),
            AttributeProto::int("numAnchors", i64::from(p.num_anchors)),
            AttributeProto::int("numClasses", i64::from(p.num_classes)),
            AttributeProto::int("inputMultiplier", i64::from(p.input_multiplier)),
            AttributeProto::floats("anchors", p.anchors.clone()),
            AttributeProto::float("scaleXY", p.scale_xy),
            AttributeProto::int("newCoords", i64::from(p.new_coords)),
        ],
    );
    proto.domain = PLUGIN_DOMAIN.into();
    proto
}
