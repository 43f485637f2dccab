//! Display implementations and text dump for debugging.

use std::fmt;

use crate::graph::{Activation, ComputeGraph, ConstantOrigin, GraphOp};
use crate::types::{Scalar, TensorShape};

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.byte_width() * 8)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str("x")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Softplus => write!(f, "softplus"),
            Self::Tanh => write!(f, "tanh"),
            Self::LeakyRelu { alpha } => write!(f, "leaky_relu(alpha={alpha})"),
        }
    }
}

impl fmt::Display for GraphOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv2d(p) | Self::ConvTranspose2d(p) => {
                write!(
                    f,
                    "{} out={} k={} s={} p={}",
                    self.op_name(),
                    p.out_channels,
                    p.kernel,
                    p.stride,
                    p.padding
                )?;
                if p.groups != 1 {
                    write!(f, " groups={}", p.groups)?;
                }
                if p.bias.is_some() {
                    f.write_str(" +bias")?;
                }
                Ok(())
            }
            Self::Activation(a) => write!(f, "{a}"),
            Self::Concat { axis } => write!(f, "Concat axis={axis}"),
            Self::MaxPool2d(p) => write!(
                f,
                "MaxPool k={} s={} p={}",
                p.kernel, p.stride, p.padding
            ),
            Self::DetectionDecode(p) => write!(
                f,
                "YoloLayer grid={}x{} anchors={} classes={} stride={} scale_xy={} new_coords={}",
                p.grid_width,
                p.grid_height,
                p.num_anchors,
                p.num_classes,
                p.input_multiplier,
                p.scale_xy,
                p.new_coords
            ),
            Self::ChannelAffine { .. } | Self::Mul | Self::Add => f.write_str(self.op_name()),
        }
    }
}

/// Dump a graph as human-readable text: interface, constants summary, and
/// one line per node in insertion order.
pub fn dump_graph(graph: &ComputeGraph) -> String {
    let mut out = String::new();

    out.push_str("Inputs:\n");
    for &edge in &graph.inputs {
        let info = graph.tensor(edge);
        out.push_str(&format!("  %{} {}: {} {}\n", edge.0, info.name, info.scalar, info.shape));
    }

    out.push_str("\nOutputs:\n");
    for &edge in &graph.outputs {
        let info = graph.tensor(edge);
        out.push_str(&format!("  %{} {}: {} {}\n", edge.0, info.name, info.scalar, info.shape));
    }

    let learned = graph
        .constants
        .iter()
        .filter(|(_, c)| c.origin == ConstantOrigin::Learned)
        .count();
    out.push_str(&format!(
        "\nConstants: {} ({} learned, {} derived, {} bytes)\n",
        graph.constants.len(),
        learned,
        graph.constants.len() - learned,
        graph.constant_bytes()
    ));

    out.push_str(&format!("\nNodes: {}\n", graph.node_count()));
    for node in &graph.nodes {
        let inputs: Vec<String> = node.inputs.iter().map(|e| format!("%{}", e.0)).collect();
        let outputs: Vec<String> = node
            .outputs
            .iter()
            .map(|e| format!("%{} {}", e.0, graph.shape(*e)))
            .collect();
        out.push_str(&format!(
            "  {} = {} ({})  ; {}\n",
            outputs.join(", "),
            node.op,
            inputs.join(", "),
            node.name
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Constant, PoolParams};

    #[test]
    fn display_scalar() {
        assert_eq!(format!("{}", Scalar::F32), "f32");
    }

    #[test]
    fn display_shape() {
        assert_eq!(format!("{}", TensorShape::chw(3, 608, 608)), "[3x608x608]");
        assert_eq!(format!("{}", TensorShape::table(22743, 10)), "[22743x10]");
    }

    #[test]
    fn display_ops() {
        assert_eq!(
            format!("{}", GraphOp::Activation(Activation::LeakyRelu { alpha: 0.1 })),
            "leaky_relu(alpha=0.1)"
        );
        assert_eq!(
            format!(
                "{}",
                GraphOp::MaxPool2d(PoolParams {
                    kernel: 5,
                    stride: 1,
                    padding: 2
                })
            ),
            "MaxPool k=5 s=1 p=2"
        );
        assert_eq!(format!("{}", GraphOp::Concat { axis: 0 }), "Concat axis=0");
    }

    #[test]
    fn dump_lists_interface_and_nodes() {
        let mut graph = ComputeGraph::new();
        let x = graph.add_input("input", Scalar::F32, TensorShape::chw(4, 8, 8));
        graph.add_constant(Constant::derived("unused", vec![2], vec![0.0, 1.0]));
        let y = graph
            .add_op(GraphOp::Activation(Activation::Tanh), &[x], "act")
            .unwrap();
        graph.mark_output(y, "detections");

        let text = dump_graph(&graph);
        assert!(text.contains("input: f32 [4x8x8]"));
        assert!(text.contains("detections: f32 [4x8x8]"));
        assert!(text.contains("Constants: 1 (0 learned, 1 derived, 8 bytes)"));
        assert!(text.contains("Nodes: 1"));
        assert!(text.contains("tanh (%0)  ; act"));
    }
}
