//! ONNX backend emitter for the detector graph.
//!
//! Lowers a finished [`ComputeGraph`] to an ONNX (`.onnx`) model using
//! protobuf serialization via prost. The detection decode primitive is
//! emitted as a plugin op for the downstream engine builder.

use prost::Message;
use yolo_backend_core::{
    Backend, BackendError, BackendOptions, BackendOutput, Diagnostic, OutputContent, Precision,
};
use yolo_ir::{ComputeGraph, GraphOp};

mod lower;
#[doc(hidden)]
pub mod proto;

pub use lower::build_model;

/// ONNX backend that compiles a detector graph into a `.onnx` model file.
#[derive(Debug)]
pub struct OnnxBackend;

impl Backend for OnnxBackend {
    fn name(&self) -> &str {
        "ONNX"
    }

    fn targets(&self) -> &[&str] {
        &["onnx"]
    }

    fn compile(
        &self,
        graph: &ComputeGraph,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        if graph.nodes.is_empty() {
            return Err(BackendError::InvalidGraph("graph has no nodes".into()));
        }
        if opts.max_batch_size != 1 {
            return Err(BackendError::Unsupported(format!(
                "max batch size {} (the exported model has a fixed batch of 1)",
                opts.max_batch_size
            )));
        }

        let model = lower::build_model(graph, opts)?;
        let bytes = model.encode_to_vec();
        log::info!(
            "lowered {} graph nodes to {} ONNX nodes ({} bytes)",
            graph.node_count(),
            model.graph.as_ref().map_or(0, |g| g.node.len()),
            bytes.len()
        );

        let heads = graph
            .nodes
            .iter()
            .filter(|n| matches!(n.op, GraphOp::DetectionDecode(_)))
            .count();
        let mut output = BackendOutput::single("model.onnx", OutputContent::Binary(bytes));
        output.diagnostics.push(Diagnostic::info(format!(
            "{} nodes, {} constants ({} bytes), {heads} detection head(s)",
            graph.node_count(),
            graph.constants.len(),
            graph.constant_bytes()
        )));
        if opts.precision == Precision::Reduced {
            output.diagnostics.push(Diagnostic::warning(
                "weights are stored as fp32; reduced precision is applied by the engine builder",
            ));
        }
        Ok(output)
    }
}
