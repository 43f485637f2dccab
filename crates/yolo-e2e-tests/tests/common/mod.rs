use yolo_backend_core::{BackendOutput, OutputContent};
use yolo_backend_onnx::proto::ModelProto;
#[allow(unused_imports)]
use yolo_ir::ComputeGraph;
use yolo_net::BuildConfig;
use yolo_weights::NamedWeightMap;

/// Synthesized weights for the full detector under `config`.
#[allow(dead_code)]
pub fn yolov4_weights(config: &BuildConfig) -> NamedWeightMap {
    yolo_e2e_tests::synthetic_weights(&yolo_net::yolov4(), config).expect("manifest failed")
}

/// Build the full detector with synthesized weights.
#[allow(dead_code)]
pub fn build_yolov4(config: &BuildConfig) -> ComputeGraph {
    let weights = yolov4_weights(config);
    yolo_net::build_network(&weights, config).expect("network assembly failed")
}

/// Extract the first binary output from a `BackendOutput`.
#[allow(dead_code)]
pub fn first_binary(output: &BackendOutput) -> &[u8] {
    match &output.files[0].content {
        OutputContent::Binary(b) => b,
        OutputContent::Text(_) => panic!("expected binary output, got text"),
    }
}

/// Extract the first text output from a `BackendOutput`.
#[allow(dead_code)]
pub fn first_text(output: &BackendOutput) -> &str {
    match &output.files[0].content {
        OutputContent::Text(t) => t,
        OutputContent::Binary(_) => panic!("expected text output, got binary"),
    }
}

/// Decode the ONNX model a backend produced.
#[allow(dead_code)]
pub fn decode_onnx(output: &BackendOutput) -> ModelProto {
    use prost::Message;
    ModelProto::decode(first_binary(output)).expect("failed to decode ONNX model")
}
