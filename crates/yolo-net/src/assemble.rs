//! Blueprint interpreter.

use std::collections::HashMap;

use yolo_ir::{ComputeGraph, EdgeId, IrError, TensorShape};
use yolo_weights::NamedWeightMap;

use crate::block::NetBuilder;
use crate::blueprint::{Blueprint, LayerOp};
use crate::head::DetectionHeadBuilder;
use crate::{BuildConfig, BuildError};

/// Instantiates a [`Blueprint`] into a [`ComputeGraph`].
#[derive(Debug)]
pub struct TopologyAssembler<'a> {
    blueprint: &'a Blueprint,
    config: &'a BuildConfig,
}

impl<'a> TopologyAssembler<'a> {
    pub fn new(blueprint: &'a Blueprint, config: &'a BuildConfig) -> Self {
        Self { blueprint, config }
    }

    /// Build the graph. The last blueprint entry becomes the sole output,
    /// named after [`BuildConfig::output_name`].
    pub fn assemble(&self, weights: &NamedWeightMap) -> Result<ComputeGraph, BuildError> {
        let config = self.config;
        config.validate()?;
        self.blueprint.validate()?;

        let mut net = NetBuilder::new(weights, config.bn_eps, config.leaky_slope);
        let heads = DetectionHeadBuilder::new(config);
        let input = net.input(
            &config.input_name,
            config.input_channels,
            config.input_height,
            config.input_width,
        );

        let mut symbols: HashMap<&str, EdgeId> = HashMap::new();
        symbols.insert(self.blueprint.input(), input);
        let mut last = input;

        for spec in self.blueprint.specs() {
            let inputs = spec
                .inputs
                .iter()
                .map(|name| {
                    symbols
                        .get(name.as_str())
                        .copied()
                        .ok_or_else(|| BuildError::UnknownReference {
                            node: spec.name.clone(),
                            reference: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let out = match &spec.op {
                LayerOp::ConvBlock {
                    index,
                    conv,
                    activation,
                } => net.conv_block(inputs[0], *conv, *index, *activation)?,
                LayerOp::Sum => net.sum(inputs[0], inputs[1], &spec.name)?,
                LayerOp::Concat => net.concat(&inputs, &spec.name)?,
                LayerOp::MaxPool { kernel, padding } => {
                    net.max_pool_same(inputs[0], *kernel, *padding, &spec.name)?
                }
                LayerOp::Upsample => net.upsample(inputs[0], &spec.name)?,
                LayerOp::Head { head, index } => {
                    heads.build(&mut net, inputs[0], *head, *index, &spec.name)?
                }
                LayerOp::Merge => heads.merge(&mut net, &inputs, &spec.name)?,
            };
            log::debug!("{} -> {}", spec.name, net.shape(out));
            symbols.insert(&spec.name, out);
            last = out;
        }

        let rows = config.total_detections().ok_or_else(|| {
            BuildError::InvalidConfig("detection row count overflows".into())
        })?;
        let expected = TensorShape::table(rows, config.row_width());
        if net.shape(last) != &expected {
            return Err(IrError::ShapeMismatch {
                node: config.output_name.clone(),
                expected,
                found: net.shape(last).clone(),
            }
            .into());
        }

        let graph = net.finish(last, &config.output_name)?;
        log::info!(
            "assembled {} nodes, {} constants ({} bytes)",
            graph.node_count(),
            graph.constants.len(),
            graph.constant_bytes()
        );
        Ok(graph)
    }
}
