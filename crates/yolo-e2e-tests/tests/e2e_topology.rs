mod common;

use std::sync::Arc;

use yolo_ir::{Activation, ConstantOrigin, GraphOp, TensorShape};
use yolo_net::{BuildConfig, NUM_ANCHORS};

fn decode_params(graph: &yolo_ir::ComputeGraph) -> Vec<&yolo_ir::DecodeParams> {
    graph
        .nodes
        .iter()
        .filter_map(|n| match &n.op {
            GraphOp::DetectionDecode(p) => Some(p),
            _ => None,
        })
        .collect()
}

#[test]
fn default_build_produces_detection_table() {
    let config = BuildConfig::default();
    let graph = common::build_yolov4(&config);

    assert_eq!(graph.inputs.len(), 1);
    assert_eq!(graph.outputs.len(), 1);
    let input = graph.tensor(graph.inputs[0]);
    assert_eq!(input.name, "input");
    assert_eq!(input.shape, TensorShape::chw(3, 608, 608));

    let output = graph.tensor(graph.outputs[0]);
    assert_eq!(output.name, "detections");
    assert_eq!(output.shape, TensorShape::table(22743, 10));
}

#[test]
fn heads_decode_three_scales() {
    let config = BuildConfig::default();
    let graph = common::build_yolov4(&config);
    let heads = decode_params(&graph);
    assert_eq!(heads.len(), 3);

    let grids: Vec<_> = heads.iter().map(|p| (p.grid_height, p.grid_width)).collect();
    assert_eq!(grids, vec![(76, 76), (38, 38), (19, 19)]);
    let multipliers: Vec<_> = heads.iter().map(|p| p.input_multiplier).collect();
    assert_eq!(multipliers, vec![8, 16, 32]);
    let scales: Vec<_> = heads.iter().map(|p| p.scale_xy).collect();
    assert_eq!(scales, vec![1.2, 1.1, 1.05]);
    assert_eq!(heads[2].anchors, vec![142.0, 110.0, 192.0, 243.0, 459.0, 401.0]);
    assert!(heads.iter().all(|p| p.num_anchors == NUM_ANCHORS && p.num_classes == 5));

    // Each decode consumes a 30-channel projection of its grid.
    for node in graph.nodes.iter().filter(|n| matches!(n.op, GraphOp::DetectionDecode(_))) {
        let shape = graph.shape(node.inputs[0]);
        assert_eq!(shape.channels(), 30, "{}", node.name);
    }
}

#[test]
fn backbone_and_neck_shapes() {
    let config = BuildConfig::default();
    let graph = common::build_yolov4(&config);
    let shape_of = |name: &str| {
        let node = graph.nodes.iter().find(|n| n.name == name).unwrap();
        graph.shape(node.outputs[0]).clone()
    };

    assert_eq!(shape_of("model.0.mish"), TensorShape::chw(32, 608, 608));
    assert_eq!(shape_of("model.10.mish"), TensorShape::chw(64, 304, 304));
    assert_eq!(shape_of("model.23.mish"), TensorShape::chw(128, 152, 152));
    assert_eq!(shape_of("model.54.mish"), TensorShape::chw(256, 76, 76));
    assert_eq!(shape_of("model.85.mish"), TensorShape::chw(512, 38, 38));
    assert_eq!(shape_of("model.104.mish"), TensorShape::chw(1024, 19, 19));
    assert_eq!(shape_of("cat113"), TensorShape::chw(2048, 19, 19));
    assert_eq!(shape_of("up118"), TensorShape::chw(256, 38, 38));
    assert_eq!(shape_of("cat121"), TensorShape::chw(512, 38, 38));
    assert_eq!(shape_of("up128"), TensorShape::chw(128, 76, 76));
    assert_eq!(shape_of("cat142"), TensorShape::chw(512, 38, 38));
    assert_eq!(shape_of("cat153"), TensorShape::chw(1024, 19, 19));
}

#[test]
fn activations_follow_the_stage() {
    let config = BuildConfig::default();
    let graph = common::build_yolov4(&config);

    let count = |pred: &dyn Fn(&GraphOp) -> bool| graph.nodes.iter().filter(|n| pred(&n.op)).count();
    let softplus = count(&|op: &GraphOp| matches!(op, GraphOp::Activation(Activation::Softplus)));
    let leaky = count(&|op: &GraphOp| {
        matches!(op, GraphOp::Activation(Activation::LeakyRelu { alpha }) if *alpha == 0.1)
    });
    let affine = count(&|op: &GraphOp| matches!(op, GraphOp::ChannelAffine { .. }));

    // 72 backbone blocks use Mish, 35 neck blocks use the leaky rectifier.
    assert_eq!(softplus, 72);
    assert_eq!(leaky, 35);
    assert_eq!(affine, 107);

    let upsample_kernels: Vec<_> = graph
        .constants
        .iter()
        .filter(|(_, c)| c.name.ends_with(".kernel"))
        .map(|(_, c)| c.len())
        .collect();
    assert_eq!(upsample_kernels, vec![256 * 4, 128 * 4]);
}

#[test]
fn learned_buffers_are_shared_with_the_map() {
    let config = BuildConfig::default();
    let weights = common::yolov4_weights(&config);
    let graph = yolo_net::build_network(&weights, &config).unwrap();

    let mut learned = 0;
    for (_, constant) in graph.constants.iter() {
        if constant.origin == ConstantOrigin::Learned {
            learned += 1;
            let source = weights.get(&constant.name).unwrap().shared();
            assert!(Arc::ptr_eq(&constant.data, &source), "{}", constant.name);
        }
    }
    // 107 block weights plus three head weights and biases.
    assert_eq!(learned, 107 + 6);
}

#[test]
fn rectangular_input_and_custom_classes() {
    let config = BuildConfig {
        input_width: 416,
        input_height: 320,
        num_classes: 80,
        ..Default::default()
    };
    let graph = common::build_yolov4(&config);
    let rows = 3 * (40 * 52 + 20 * 26 + 10 * 13);
    assert_eq!(graph.shape(graph.outputs[0]), &TensorShape::table(rows, 85));
    assert_eq!(config.total_detections(), Some(rows));
}

#[test]
fn build_is_deterministic() {
    let config = BuildConfig::default();
    let weights = common::yolov4_weights(&config);
    let a = yolo_net::build_network(&weights, &config).unwrap();
    let b = yolo_net::build_network(&weights, &config).unwrap();
    assert_eq!(a.node_count(), b.node_count());
    assert_eq!(yolo_ir::dump_graph(&a), yolo_ir::dump_graph(&b));
}
