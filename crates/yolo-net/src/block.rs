//! Graph-building primitives: convolution blocks, sums, concatenation,
//! pooling and upsampling.
//!
//! [`NetBuilder`] owns the graph under construction and a borrowed view of
//! the weight map. Every learned constant it creates shares the map's buffer;
//! fused coefficients and synthetic kernels are derived buffers owned by the
//! graph.

use std::collections::HashSet;

use yolo_ir::{
    Activation, ComputeGraph, Constant, ConvParams, DecodeParams, EdgeId, GraphOp, IrError,
    PoolParams, Scalar, TensorShape, shape::window_output,
};
use yolo_weights::{NamedWeightMap, WeightTensor};

use crate::BuildError;
use crate::norm::FusedAffine;

/// Activation following a convolution block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockActivation {
    /// `x * tanh(softplus(x))`, built from three primitives.
    Mish,
    /// Leaky rectifier with the configured slope.
    Leaky,
}

/// Geometry of a square convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvSpec {
    pub out_channels: u32,
    pub kernel: u32,
    pub stride: u32,
    pub padding: u32,
}

impl ConvSpec {
    pub const fn new(out_channels: u32, kernel: u32, stride: u32, padding: u32) -> Self {
        Self {
            out_channels,
            kernel,
            stride,
            padding,
        }
    }

    /// 1x1, stride 1.
    pub const fn pointwise(out_channels: u32) -> Self {
        Self::new(out_channels, 1, 1, 0)
    }

    /// 3x3, stride 1, size preserving.
    pub const fn spatial(out_channels: u32) -> Self {
        Self::new(out_channels, 3, 1, 1)
    }

    /// 3x3, stride 2: halves the spatial extent.
    pub const fn downsample(out_channels: u32) -> Self {
        Self::new(out_channels, 3, 2, 1)
    }

    /// Elements of the `[out, in, k, k]` weight for `in_channels` inputs.
    pub fn weight_len(&self, in_channels: u32) -> usize {
        self.out_channels as usize * in_channels as usize * (self.kernel * self.kernel) as usize
    }
}

/// Key of the convolution weight of layer `index`.
pub fn conv_weight_key(index: u32) -> String {
    format!("model.{index}.conv.weight")
}

/// Key of the convolution bias of layer `index`.
pub fn conv_bias_key(index: u32) -> String {
    format!("model.{index}.conv.bias")
}

/// Prefix of the normalization statistics of layer `index`.
pub fn bn_prefix(index: u32) -> String {
    format!("model.{index}.bn")
}

/// Incrementally builds a [`ComputeGraph`] from a weight map.
#[derive(Debug)]
pub struct NetBuilder<'w> {
    graph: ComputeGraph,
    weights: &'w NamedWeightMap,
    used: HashSet<String>,
    bn_eps: f32,
    leaky_slope: f32,
}

impl<'w> NetBuilder<'w> {
    pub fn new(weights: &'w NamedWeightMap, bn_eps: f32, leaky_slope: f32) -> Self {
        Self {
            graph: ComputeGraph::new(),
            weights,
            used: HashSet::new(),
            bn_eps,
            leaky_slope,
        }
    }

    /// Declare the network input as a `[channels, height, width]` tensor.
    pub fn input(&mut self, name: &str, channels: u32, height: u32, width: u32) -> EdgeId {
        self.graph
            .add_input(name, Scalar::F32, TensorShape::chw(channels, height, width))
    }

    pub fn graph(&self) -> &ComputeGraph {
        &self.graph
    }

    pub fn shape(&self, edge: EdgeId) -> &TensorShape {
        self.graph.shape(edge)
    }

    fn weight(&mut self, key: &str) -> Result<&'w WeightTensor, BuildError> {
        let weights = self.weights;
        let tensor = weights.get(key).ok_or_else(|| BuildError::MissingWeight {
            key: key.into(),
        })?;
        self.used.insert(key.into());
        Ok(tensor)
    }

    fn learned(&mut self, key: &str, dims: Vec<u32>) -> Result<Constant, BuildError> {
        let tensor = self.weight(key)?;
        let expected = dims.iter().map(|&d| d as usize).product::<usize>();
        if tensor.len() != expected {
            return Err(BuildError::WeightShape {
                key: key.into(),
                expected,
                found: tensor.len(),
            });
        }
        Ok(Constant::learned(key, dims, tensor.shared()))
    }

    /// A plain convolution of layer `index`, named `model.<index>.conv`.
    ///
    /// The bias is read from `model.<index>.conv.bias` when `with_bias` is set.
    pub fn conv(
        &mut self,
        input: EdgeId,
        spec: ConvSpec,
        index: u32,
        with_bias: bool,
    ) -> Result<EdgeId, BuildError> {
        let in_channels = self.shape(input).channels();
        let weight = self.learned(
            &conv_weight_key(index),
            vec![spec.out_channels, in_channels, spec.kernel, spec.kernel],
        )?;
        let bias = if with_bias {
            Some(self.learned(&conv_bias_key(index), vec![spec.out_channels])?)
        } else {
            None
        };

        let weight = self.graph.add_constant(weight);
        let bias = bias.map(|b| self.graph.add_constant(b));
        let op = GraphOp::Conv2d(ConvParams {
            out_channels: spec.out_channels,
            kernel: spec.kernel,
            stride: spec.stride,
            padding: spec.padding,
            groups: 1,
            weight,
            bias,
        });
        Ok(self.graph.add_op(op, &[input], format!("model.{index}.conv"))?)
    }

    /// Fused normalization over `input` using the statistics under `prefix`.
    pub fn batch_norm(&mut self, input: EdgeId, prefix: &str) -> Result<EdgeId, BuildError> {
        let fused = FusedAffine::from_weights(self.weights, prefix, self.bn_eps)?;
        let channels = self.shape(input).channels();
        if fused.len() != channels as usize {
            return Err(BuildError::MissingStatistics {
                prefix: prefix.into(),
                reason: format!("{} channels for a {channels}-channel input", fused.len()),
            });
        }
        for key in crate::norm::statistic_keys(prefix) {
            self.used.insert(key);
        }

        let dims = vec![channels];
        let FusedAffine { scale, shift, power } = fused;
        let scale = self
            .graph
            .add_constant(Constant::derived(format!("{prefix}.scale"), dims.clone(), scale));
        let shift = self
            .graph
            .add_constant(Constant::derived(format!("{prefix}.shift"), dims.clone(), shift));
        let power = self
            .graph
            .add_constant(Constant::derived(format!("{prefix}.power"), dims, power));
        Ok(self
            .graph
            .add_op(GraphOp::ChannelAffine { scale, shift, power }, &[input], prefix)?)
    }

    /// `x * tanh(softplus(x))`.
    pub fn mish(&mut self, x: EdgeId, name: &str) -> Result<EdgeId, BuildError> {
        let sp = self.graph.add_op(
            GraphOp::Activation(Activation::Softplus),
            &[x],
            format!("{name}.softplus"),
        )?;
        let th = self
            .graph
            .add_op(GraphOp::Activation(Activation::Tanh), &[sp], format!("{name}.tanh"))?;
        Ok(self.graph.add_op(GraphOp::Mul, &[th, x], name)?)
    }

    /// Leaky rectifier with the configured slope.
    pub fn leaky(&mut self, x: EdgeId, name: &str) -> Result<EdgeId, BuildError> {
        let op = GraphOp::Activation(Activation::LeakyRelu {
            alpha: self.leaky_slope,
        });
        Ok(self.graph.add_op(op, &[x], name)?)
    }

    /// Convolution without bias, fused normalization and an activation:
    /// the standard block of layer `index`.
    pub fn conv_block(
        &mut self,
        input: EdgeId,
        spec: ConvSpec,
        index: u32,
        activation: BlockActivation,
    ) -> Result<EdgeId, BuildError> {
        let conv = self.conv(input, spec, index, false)?;
        let bn = self.batch_norm(conv, &bn_prefix(index))?;
        match activation {
            BlockActivation::Mish => self.mish(bn, &format!("model.{index}.mish")),
            BlockActivation::Leaky => self.leaky(bn, &format!("model.{index}.leaky")),
        }
    }

    /// Element-wise sum of two identically shaped tensors.
    pub fn sum(&mut self, a: EdgeId, b: EdgeId, name: &str) -> Result<EdgeId, BuildError> {
        Ok(self.graph.add_op(GraphOp::Add, &[a, b], name)?)
    }

    /// Concatenation along the leading axis (channels, or rows of a table).
    pub fn concat(&mut self, inputs: &[EdgeId], name: &str) -> Result<EdgeId, BuildError> {
        Ok(self
            .graph
            .add_op(GraphOp::Concat { axis: 0 }, inputs, name)?)
    }

    /// Stride-1 max pooling that must leave the spatial extent unchanged.
    pub fn max_pool_same(
        &mut self,
        x: EdgeId,
        kernel: u32,
        padding: u32,
        name: &str,
    ) -> Result<EdgeId, BuildError> {
        let shape = self.shape(x);
        if let Some((h, w)) = shape.spatial() {
            let out_h = window_output(h, kernel, 1, padding).unwrap_or(0);
            let out_w = window_output(w, kernel, 1, padding).unwrap_or(0);
            if (out_h, out_w) != (h, w) {
                return Err(IrError::ShapeMismatch {
                    node: name.into(),
                    expected: shape.clone(),
                    found: TensorShape::chw(shape.channels(), out_h, out_w),
                }
                .into());
            }
        }
        let op = GraphOp::MaxPool2d(PoolParams {
            kernel,
            stride: 1,
            padding,
        });
        Ok(self.graph.add_op(op, &[x], name)?)
    }

    /// Nearest-neighbour 2x upsampling as a depthwise transposed convolution
    /// with an all-ones 2x2 kernel sized to this layer's channel count.
    pub fn upsample(&mut self, x: EdgeId, name: &str) -> Result<EdgeId, BuildError> {
        let channels = self.shape(x).channels();
        let kernel = Constant::derived(
            format!("{name}.kernel"),
            vec![channels, 1, 2, 2],
            vec![1.0; channels as usize * 4],
        );
        let weight = self.graph.add_constant(kernel);
        let op = GraphOp::ConvTranspose2d(ConvParams {
            out_channels: channels,
            kernel: 2,
            stride: 2,
            padding: 0,
            groups: channels,
            weight,
            bias: None,
        });
        Ok(self.graph.add_op(op, &[x], name)?)
    }

    /// The detection decode primitive.
    pub fn decode(
        &mut self,
        x: EdgeId,
        params: DecodeParams,
        name: &str,
    ) -> Result<EdgeId, BuildError> {
        Ok(self
            .graph
            .add_op(GraphOp::DetectionDecode(params), &[x], name)?)
    }

    /// Weight keys present in the map that no layer consumed, sorted.
    pub fn unused_weights(&self) -> Vec<&'w str> {
        let weights = self.weights;
        weights
            .names()
            .into_iter()
            .filter(|name| !self.used.contains(*name))
            .collect()
    }

    /// Declare `output` as the sole graph output and hand over the graph.
    pub fn finish(mut self, output: EdgeId, name: &str) -> Result<ComputeGraph, BuildError> {
        let unused = self.unused_weights();
        if !unused.is_empty() {
            let shown = unused.len().min(4);
            log::warn!(
                "{} weight(s) not used by the network: {}{}",
                unused.len(),
                unused[..shown].join(", "),
                if unused.len() > shown { ", ..." } else { "" }
            );
        }
        self.graph.mark_output(output, name);
        self.graph.validate_interface()?;
        Ok(self.graph)
    }
}
