//! Declarative network topology.
//!
//! A [`Blueprint`] is an ordered list of [`NodeSpec`]s. Each spec names the
//! tensor it defines, the operation producing it and the symbolic names of
//! its inputs, which must all be defined earlier in the list. The assembler
//! walks the list once; the blueprint itself never touches a graph.

use std::collections::{HashMap, HashSet};

use crate::block::{BlockActivation, ConvSpec, bn_prefix, conv_bias_key, conv_weight_key};
use crate::norm::statistic_keys;
use crate::{BuildConfig, BuildError};

/// Operation of one blueprint entry.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerOp {
    /// Convolution, fused normalization and activation of layer `index`.
    ConvBlock {
        index: u32,
        conv: ConvSpec,
        activation: BlockActivation,
    },
    /// Element-wise sum of two tensors.
    Sum,
    /// Channel concatenation, in input order.
    Concat,
    /// Size-preserving max pooling.
    MaxPool { kernel: u32, padding: u32 },
    /// 2x nearest-neighbour upsampling.
    Upsample,
    /// Detection head `head`, projected by the biased convolution of layer `index`.
    Head { head: usize, index: u32 },
    /// Row concatenation of decoded detections.
    Merge,
}

impl LayerOp {
    fn arity(&self) -> Arity {
        match self {
            Self::Sum => Arity::Exactly(2),
            Self::Concat | Self::Merge => Arity::AtLeast(1),
            _ => Arity::Exactly(1),
        }
    }
}

#[derive(Clone, Copy)]
enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Self::Exactly(k) => n == k,
            Self::AtLeast(k) => n >= k,
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Exactly(k) => k.to_string(),
            Self::AtLeast(k) => format!("at least {k}"),
        }
    }
}

/// One entry of a blueprint.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    /// Symbol defined by this entry.
    pub name: String,
    pub op: LayerOp,
    /// Symbols consumed, in operand order.
    pub inputs: Vec<String>,
}

/// A weight the blueprint requires, with its expected element count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightRequirement {
    pub key: String,
    pub len: usize,
}

/// An ordered, symbolic description of a network.
#[derive(Clone, Debug, PartialEq)]
pub struct Blueprint {
    input: String,
    specs: Vec<NodeSpec>,
}

impl Blueprint {
    /// An empty blueprint whose network input is bound to `input`.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            specs: Vec::new(),
        }
    }

    /// Symbol of the network input.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn specs(&self) -> &[NodeSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Append an entry and return its symbol.
    pub fn push(&mut self, name: impl Into<String>, op: LayerOp, inputs: &[&str]) -> String {
        let name = name.into();
        self.specs.push(NodeSpec {
            name: name.clone(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        name
    }

    /// `conv<index>`: a convolution block of layer `index`.
    pub fn conv(
        &mut self,
        index: u32,
        conv: ConvSpec,
        activation: BlockActivation,
        input: &str,
    ) -> String {
        self.push(
            format!("conv{index}"),
            LayerOp::ConvBlock {
                index,
                conv,
                activation,
            },
            &[input],
        )
    }

    /// Check that names are unique, every reference is defined before use
    /// and every entry has a valid number of inputs.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.specs.is_empty() {
            return Err(BuildError::InvalidConfig("blueprint is empty".into()));
        }
        let mut defined: HashSet<&str> = HashSet::from([self.input.as_str()]);
        for spec in &self.specs {
            let arity = spec.op.arity();
            if !arity.accepts(spec.inputs.len()) {
                return Err(BuildError::BlueprintArity {
                    node: spec.name.clone(),
                    expected: arity.describe(),
                    found: spec.inputs.len(),
                });
            }
            if let Some(missing) = spec.inputs.iter().find(|i| !defined.contains(i.as_str())) {
                return Err(BuildError::UnknownReference {
                    node: spec.name.clone(),
                    reference: missing.clone(),
                });
            }
            if !defined.insert(&spec.name) {
                return Err(BuildError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every weight key the blueprint reads under `config`, in declaration
    /// order, with the element count the key must carry.
    pub fn weight_manifest(&self, config: &BuildConfig) -> Result<Vec<WeightRequirement>, BuildError> {
        config.validate()?;
        self.validate()?;
        let mut channels: HashMap<&str, u32> = HashMap::from([(self.input.as_str(), config.input_channels)]);
        let mut manifest = Vec::new();

        for spec in &self.specs {
            let in_channels: Vec<u32> = spec
                .inputs
                .iter()
                .map(|i| channels.get(i.as_str()).copied().unwrap_or(0))
                .collect();
            let first = in_channels.first().copied().unwrap_or(0);

            let out = match &spec.op {
                LayerOp::ConvBlock { index, conv, .. } => {
                    manifest.push(WeightRequirement {
                        key: conv_weight_key(*index),
                        len: conv.weight_len(first),
                    });
                    for key in statistic_keys(&bn_prefix(*index)) {
                        manifest.push(WeightRequirement {
                            key,
                            len: conv.out_channels as usize,
                        });
                    }
                    conv.out_channels
                }
                LayerOp::Head { index, .. } => {
                    let projection = ConvSpec::pointwise(config.head_channels());
                    manifest.push(WeightRequirement {
                        key: conv_weight_key(*index),
                        len: projection.weight_len(first),
                    });
                    manifest.push(WeightRequirement {
                        key: conv_bias_key(*index),
                        len: projection.out_channels as usize,
                    });
                    0
                }
                LayerOp::Concat => in_channels.iter().sum(),
                LayerOp::Sum | LayerOp::MaxPool { .. } | LayerOp::Upsample => first,
                LayerOp::Merge => 0,
            };
            channels.insert(&spec.name, out);
        }
        Ok(manifest)
    }
}

/// Layers of one cross-stage-partial stage.
///
/// The stage input is downsampled, then split into a passthrough branch and
/// a residual branch of `repeats` bottleneck blocks; the two branches are
/// concatenated and projected back to `channels`.
fn csp_stage(bp: &mut Blueprint, input: &str, first: u32, channels: u32, repeats: u32) -> String {
    use BlockActivation::Mish;

    // The first stage keeps full width in its branches.
    let hidden = if first == 1 { channels } else { channels / 2 };
    let reduce = channels / 2;

    let down = bp.conv(first, ConvSpec::downsample(channels), Mish, input);
    let passthrough = bp.conv(first + 1, ConvSpec::pointwise(hidden), Mish, &down);
    let mut running = bp.conv(first + 3, ConvSpec::pointwise(hidden), Mish, &down);

    for k in 0..repeats {
        let at = first + 4 + 3 * k;
        let a = bp.conv(at, ConvSpec::pointwise(reduce), Mish, &running);
        let b = bp.conv(at + 1, ConvSpec::spatial(hidden), Mish, &a);
        running = bp.push(format!("sum{}", at + 2), LayerOp::Sum, &[&b, &running]);
    }

    let tail = first + 4 + 3 * repeats;
    let merged = bp.conv(tail, ConvSpec::pointwise(hidden), Mish, &running);
    let cat = bp.push(format!("cat{}", tail + 1), LayerOp::Concat, &[&merged, &passthrough]);
    bp.conv(tail + 2, ConvSpec::pointwise(channels), Mish, &cat)
}

/// The YOLOv4 topology: CSP-Darknet53 backbone, spatial pyramid pooling,
/// path-aggregation neck and three detection heads at strides 8, 16 and 32.
///
/// Layer indices follow the checkpoint's `model.<index>` numbering.
pub fn yolov4() -> Blueprint {
    use BlockActivation::{Leaky, Mish};
    use ConvSpec as C;

    let mut bp = Blueprint::new("input");
    let stem = bp.conv(0, C::new(32, 3, 1, 1), Mish, "input");

    // Backbone: (first layer, channels, residual blocks).
    let mut x = stem;
    let mut taps = Vec::new();
    for (first, channels, repeats) in [(1, 64, 1), (11, 128, 2), (24, 256, 8), (55, 512, 8), (86, 1024, 4)] {
        x = csp_stage(&mut bp, &x, first, channels, repeats);
        taps.push(x.clone());
    }
    let (c3, c4) = (taps[2].clone(), taps[3].clone());

    // Spatial pyramid pooling.
    let x = bp.conv(105, C::pointwise(512), Leaky, &x);
    let x = bp.conv(106, C::spatial(1024), Leaky, &x);
    let spp_in = bp.conv(107, C::pointwise(512), Leaky, &x);
    let p5 = bp.push("pool108", LayerOp::MaxPool { kernel: 5, padding: 2 }, &[&spp_in]);
    let p9 = bp.push("pool110", LayerOp::MaxPool { kernel: 9, padding: 4 }, &[&spp_in]);
    let p13 = bp.push("pool112", LayerOp::MaxPool { kernel: 13, padding: 6 }, &[&spp_in]);
    let x = bp.push("cat113", LayerOp::Concat, &[&p13, &p9, &p5, &spp_in]);

    let x = bp.conv(114, C::pointwise(512), Leaky, &x);
    let x = bp.conv(115, C::spatial(1024), Leaky, &x);
    let n5 = bp.conv(116, C::pointwise(512), Leaky, &x);

    // Top-down path.
    let x = bp.conv(117, C::pointwise(256), Leaky, &n5);
    let up = bp.push("up118", LayerOp::Upsample, &[&x]);
    let lateral = bp.conv(120, C::pointwise(256), Leaky, &c4);
    let x = bp.push("cat121", LayerOp::Concat, &[&lateral, &up]);
    let x = bp.conv(122, C::pointwise(256), Leaky, &x);
    let x = bp.conv(123, C::spatial(512), Leaky, &x);
    let x = bp.conv(124, C::pointwise(256), Leaky, &x);
    let x = bp.conv(125, C::spatial(512), Leaky, &x);
    let n4 = bp.conv(126, C::pointwise(256), Leaky, &x);

    let x = bp.conv(127, C::pointwise(128), Leaky, &n4);
    let up = bp.push("up128", LayerOp::Upsample, &[&x]);
    let lateral = bp.conv(130, C::pointwise(128), Leaky, &c3);
    let x = bp.push("cat131", LayerOp::Concat, &[&lateral, &up]);
    let x = bp.conv(132, C::pointwise(128), Leaky, &x);
    let x = bp.conv(133, C::spatial(256), Leaky, &x);
    let x = bp.conv(134, C::pointwise(128), Leaky, &x);
    let x = bp.conv(135, C::spatial(256), Leaky, &x);
    let n3 = bp.conv(136, C::pointwise(128), Leaky, &x);
    let x = bp.conv(137, C::spatial(256), Leaky, &n3);
    let small = bp.push("yolo139", LayerOp::Head { head: 0, index: 138 }, &[&x]);

    // Bottom-up path.
    let x = bp.conv(141, C::downsample(256), Leaky, &n3);
    let x = bp.push("cat142", LayerOp::Concat, &[&x, &n4]);
    let x = bp.conv(143, C::pointwise(256), Leaky, &x);
    let x = bp.conv(144, C::spatial(512), Leaky, &x);
    let x = bp.conv(145, C::pointwise(256), Leaky, &x);
    let x = bp.conv(146, C::spatial(512), Leaky, &x);
    let m4 = bp.conv(147, C::pointwise(256), Leaky, &x);
    let x = bp.conv(148, C::spatial(512), Leaky, &m4);
    let medium = bp.push("yolo150", LayerOp::Head { head: 1, index: 149 }, &[&x]);

    let x = bp.conv(152, C::downsample(512), Leaky, &m4);
    let x = bp.push("cat153", LayerOp::Concat, &[&x, &n5]);
    let x = bp.conv(154, C::pointwise(512), Leaky, &x);
    let x = bp.conv(155, C::spatial(1024), Leaky, &x);
    let x = bp.conv(156, C::pointwise(512), Leaky, &x);
    let x = bp.conv(157, C::spatial(1024), Leaky, &x);
    let x = bp.conv(158, C::pointwise(512), Leaky, &x);
    let x = bp.conv(159, C::spatial(1024), Leaky, &x);
    let large = bp.push("yolo161", LayerOp::Head { head: 2, index: 160 }, &[&x]);

    bp.push("merge", LayerOp::Merge, &[&small, &medium, &large]);
    bp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_indices(bp: &Blueprint) -> Vec<u32> {
        bp.specs()
            .iter()
            .filter_map(|s| match s.op {
                LayerOp::ConvBlock { index, .. } | LayerOp::Head { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    fn find<'a>(bp: &'a Blueprint, name: &str) -> &'a NodeSpec {
        bp.specs().iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn yolov4_is_well_formed() {
        let bp = yolov4();
        bp.validate().unwrap();
        assert_eq!(bp.specs().last().unwrap().op, LayerOp::Merge);

        let indices = conv_indices(&bp);
        assert_eq!(indices.len(), 110);
        let unique: HashSet<_> = indices.iter().collect();
        assert_eq!(unique.len(), indices.len());
        assert_eq!(*indices.iter().max().unwrap(), 160);
    }

    #[test]
    fn csp_projections_land_on_expected_layers() {
        let bp = yolov4();
        for (index, channels) in [(10, 64), (23, 128), (54, 256), (85, 512), (104, 1024)] {
            match &find(&bp, &format!("conv{index}")).op {
                LayerOp::ConvBlock { conv, activation, .. } => {
                    assert_eq!(conv.out_channels, channels);
                    assert_eq!(*activation, BlockActivation::Mish);
                }
                other => panic!("conv{index} is {other:?}"),
            }
        }
        // Residual chain of the first stage: entry, then previous sum.
        assert_eq!(find(&bp, "sum7").inputs, vec!["conv6", "conv4"]);
        assert_eq!(find(&bp, "sum17").inputs, vec!["conv16", "conv14"]);
        assert_eq!(find(&bp, "sum20").inputs, vec!["conv19", "sum17"]);
        assert_eq!(find(&bp, "cat9").inputs, vec!["conv8", "conv2"]);
    }

    #[test]
    fn neck_wiring() {
        let bp = yolov4();
        assert_eq!(
            find(&bp, "cat113").inputs,
            vec!["pool112", "pool110", "pool108", "conv107"]
        );
        assert_eq!(find(&bp, "cat121").inputs, vec!["conv120", "up118"]);
        assert_eq!(find(&bp, "conv120").inputs, vec!["conv85"]);
        assert_eq!(find(&bp, "conv130").inputs, vec!["conv54"]);
        assert_eq!(find(&bp, "cat142").inputs, vec!["conv141", "conv126"]);
        assert_eq!(find(&bp, "cat153").inputs, vec!["conv152", "conv116"]);
        assert_eq!(
            find(&bp, "merge").inputs,
            vec!["yolo139", "yolo150", "yolo161"]
        );
    }

    #[test]
    fn validate_rejects_forward_reference() {
        let mut bp = Blueprint::new("input");
        bp.push("a", LayerOp::Upsample, &["b"]);
        bp.push("b", LayerOp::Upsample, &["input"]);
        match bp.validate().unwrap_err() {
            BuildError::UnknownReference { node, reference } => {
                assert_eq!(node, "a");
                assert_eq!(reference, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_rejects_duplicates_and_bad_arity() {
        let mut bp = Blueprint::new("input");
        bp.push("a", LayerOp::Upsample, &["input"]);
        bp.push("a", LayerOp::Upsample, &["input"]);
        assert!(matches!(bp.validate(), Err(BuildError::DuplicateName { .. })));

        let mut bp = Blueprint::new("input");
        bp.push("s", LayerOp::Sum, &["input"]);
        let err = bp.validate().unwrap_err();
        assert!(matches!(err, BuildError::BlueprintArity { found: 1, .. }));

        assert!(Blueprint::new("input").validate().is_err());
    }

    #[test]
    fn manifest_covers_every_layer() {
        let config = BuildConfig::default();
        let manifest = yolov4().weight_manifest(&config).unwrap();
        // 107 conv blocks with four statistics each, three biased heads.
        assert_eq!(manifest.len(), 107 * 5 + 3 * 2);

        let len_of = |key: &str| manifest.iter().find(|w| w.key == key).map(|w| w.len);
        assert_eq!(len_of("model.0.conv.weight"), Some(32 * 3 * 9));
        assert_eq!(len_of("model.0.bn.running_var"), Some(32));
        assert_eq!(len_of("model.9.conv.weight"), None);
        assert_eq!(len_of("model.10.conv.weight"), Some(64 * 128));
        assert_eq!(len_of("model.114.conv.weight"), Some(512 * 2048));
        assert_eq!(len_of("model.138.conv.weight"), Some(30 * 256));
        assert_eq!(len_of("model.160.conv.bias"), Some(30));
    }
}
