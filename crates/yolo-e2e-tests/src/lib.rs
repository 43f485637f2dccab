//! Fixtures shared by the end-to-end tests.
//!
//! Real checkpoints are far too large to ship, so weight maps are
//! synthesized from a blueprint's manifest. Tensors of equal length and fill
//! share one buffer, which keeps a full-size map at a few tens of megabytes.

use std::collections::HashMap;
use std::sync::Arc;

use yolo_net::block::{BlockActivation, ConvSpec};
use yolo_net::{Blueprint, BuildConfig, BuildError, LayerOp};
use yolo_weights::{NamedWeightMap, WeightTensor};

/// Value every element of a synthesized tensor takes.
fn fill_for(key: &str) -> f32 {
    if key.ends_with(".running_var") || key.ends_with(".bn.weight") {
        1.0
    } else if key.ends_with(".running_mean") || key.ends_with(".bias") {
        0.0
    } else {
        0.01
    }
}

/// A weight map holding exactly the keys `blueprint` requires under `config`.
pub fn synthetic_weights(blueprint: &Blueprint, config: &BuildConfig) -> Result<NamedWeightMap, BuildError> {
    let mut buffers: HashMap<(usize, u32), Arc<[f32]>> = HashMap::new();
    let mut weights = NamedWeightMap::new();
    for req in blueprint.weight_manifest(config)? {
        let fill = fill_for(&req.key);
        let data = buffers
            .entry((req.len, fill.to_bits()))
            .or_insert_with(|| vec![fill; req.len].into())
            .clone();
        weights.insert(req.key, WeightTensor::new(data));
    }
    Ok(weights)
}

/// A 64x64 input with two classes: grids of 8, 4 and 2.
pub fn small_config() -> BuildConfig {
    BuildConfig {
        input_width: 64,
        input_height: 64,
        num_classes: 2,
        ..Default::default()
    }
}

/// A compact network exercising every layer kind, with heads at strides
/// 8, 16 and 32.
pub fn tiny_blueprint() -> Blueprint {
    use BlockActivation::{Leaky, Mish};

    let mut bp = Blueprint::new("input");
    let x = bp.conv(0, ConvSpec::new(8, 3, 1, 1), Mish, "input");
    let x = bp.conv(1, ConvSpec::downsample(8), Mish, &x);
    let x = bp.conv(2, ConvSpec::downsample(16), Mish, &x);
    let r = bp.conv(3, ConvSpec::pointwise(16), Mish, &x);
    let x = bp.push("sum4", LayerOp::Sum, &[&r, &x]);
    let s8 = bp.conv(5, ConvSpec::downsample(16), Mish, &x);
    let s16 = bp.conv(6, ConvSpec::downsample(32), Mish, &s8);
    let s32 = bp.conv(7, ConvSpec::downsample(32), Mish, &s16);

    let p5 = bp.push("pool8", LayerOp::MaxPool { kernel: 5, padding: 2 }, &[&s32]);
    let p9 = bp.push("pool9", LayerOp::MaxPool { kernel: 9, padding: 4 }, &[&s32]);
    let spp = bp.push("cat10", LayerOp::Concat, &[&p9, &p5, &s32]);
    let n5 = bp.conv(11, ConvSpec::pointwise(32), Leaky, &spp);

    let x = bp.conv(12, ConvSpec::pointwise(16), Leaky, &n5);
    let up = bp.push("up13", LayerOp::Upsample, &[&x]);
    let n4 = bp.push("cat14", LayerOp::Concat, &[&s16, &up]);
    let n4 = bp.conv(15, ConvSpec::spatial(32), Leaky, &n4);

    let a = bp.push("yolo17", LayerOp::Head { head: 0, index: 16 }, &[&s8]);
    let b = bp.push("yolo19", LayerOp::Head { head: 1, index: 18 }, &[&n4]);
    let c = bp.push("yolo21", LayerOp::Head { head: 2, index: 20 }, &[&n5]);
    bp.push("merge", LayerOp::Merge, &[&a, &b, &c]);
    bp
}
