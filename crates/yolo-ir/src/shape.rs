//! Static shape inference for graph operations.
//!
//! Every operator's output shape is computed from its input shapes and
//! parameters before the node is inserted. Any disagreement is reported as
//! an [`IrError`] naming the node.

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::graph::{Constant, ConvParams, DecodeParams, GraphOp, PoolParams};
use crate::types::TensorShape;

/// Output extent of a sliding window along one axis.
///
/// Returns `None` when the window does not fit in the padded input or the
/// stride is zero.
pub fn window_output(input: u32, kernel: u32, stride: u32, padding: u32) -> Option<u32> {
    let padded = input.checked_add(padding.checked_mul(2)?)?;
    if stride == 0 || kernel == 0 || kernel > padded {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// Output extent of a transposed convolution along one axis.
pub fn transposed_output(input: u32, kernel: u32, stride: u32, padding: u32) -> Option<u32> {
    let grown = i64::from(input.checked_sub(1)?) * i64::from(stride) + i64::from(kernel)
        - 2 * i64::from(padding);
    u32::try_from(grown).ok().filter(|&v| v > 0)
}

/// Infer the output shape of `op` applied to `inputs`.
pub fn infer_shape(
    op: &GraphOp,
    inputs: &[&TensorShape],
    constants: &Arena<Constant>,
    node: &str,
) -> Result<TensorShape, IrError> {
    match op {
        GraphOp::Conv2d(p) => {
            let x = unary_feature(inputs, node)?;
            conv_shape(p, x, constants, node, false)
        }
        GraphOp::ConvTranspose2d(p) => {
            let x = unary_feature(inputs, node)?;
            conv_shape(p, x, constants, node, true)
        }
        GraphOp::ChannelAffine { scale, shift, power } => {
            let x = unary_feature(inputs, node)?;
            for h in [*scale, *shift, *power] {
                let len = constant(constants, h, node)?.len();
                if len != x.channels() as usize {
                    return Err(geometry(
                        node,
                        format!("affine coefficient has {len} entries for {} channels", x.channels()),
                    ));
                }
            }
            Ok(x.clone())
        }
        GraphOp::Activation(_) => {
            expect_arity(inputs, 1, node)?;
            Ok(inputs[0].clone())
        }
        GraphOp::Mul | GraphOp::Add => {
            expect_arity(inputs, 2, node)?;
            if inputs[0] != inputs[1] {
                return Err(IrError::ShapeMismatch {
                    node: node.into(),
                    expected: inputs[0].clone(),
                    found: inputs[1].clone(),
                });
            }
            Ok(inputs[0].clone())
        }
        GraphOp::Concat { axis } => concat_shape(inputs, *axis as usize, node),
        GraphOp::MaxPool2d(p) => {
            let x = unary_feature(inputs, node)?;
            pool_shape(p, x, node)
        }
        GraphOp::DetectionDecode(p) => {
            let x = unary_feature(inputs, node)?;
            decode_shape(p, x, node)
        }
    }
}

fn geometry(node: &str, reason: impl Into<String>) -> IrError {
    IrError::InvalidGeometry {
        node: node.into(),
        reason: reason.into(),
    }
}

fn expect_arity(inputs: &[&TensorShape], expected: usize, node: &str) -> Result<(), IrError> {
    if inputs.len() != expected {
        return Err(IrError::Arity {
            node: node.into(),
            expected,
            found: inputs.len(),
        });
    }
    Ok(())
}

fn unary_feature<'a>(inputs: &[&'a TensorShape], node: &str) -> Result<&'a TensorShape, IrError> {
    expect_arity(inputs, 1, node)?;
    let x = inputs[0];
    if x.rank() != 3 {
        return Err(geometry(
            node,
            format!("expected a [C, H, W] feature map, found {x}"),
        ));
    }
    Ok(x)
}

fn constant<'a>(
    constants: &'a Arena<Constant>,
    handle: Handle<Constant>,
    node: &str,
) -> Result<&'a Constant, IrError> {
    constants.try_get(handle).ok_or_else(|| IrError::BadConstant {
        node: node.into(),
        index: handle.index(),
        size: constants.len(),
    })
}

fn conv_shape(
    p: &ConvParams,
    x: &TensorShape,
    constants: &Arena<Constant>,
    node: &str,
    transposed: bool,
) -> Result<TensorShape, IrError> {
    let in_channels = x.channels();
    if p.groups == 0 || in_channels % p.groups != 0 || p.out_channels % p.groups != 0 {
        return Err(geometry(
            node,
            format!(
                "{} groups do not divide {in_channels} input / {} output channels",
                p.groups, p.out_channels
            ),
        ));
    }

    // Regular: [out, in/groups, k, k]; transposed: [in, out/groups, k, k].
    let per_tap = if transposed {
        in_channels as usize * (p.out_channels / p.groups) as usize
    } else {
        p.out_channels as usize * (in_channels / p.groups) as usize
    };
    let expected = per_tap * (p.kernel * p.kernel) as usize;
    let weight = constant(constants, p.weight, node)?;
    if weight.len() != expected {
        return Err(geometry(
            node,
            format!(
                "weight '{}' has {} elements, expected {expected}",
                weight.name,
                weight.len()
            ),
        ));
    }
    if let Some(bias) = p.bias {
        let bias = constant(constants, bias, node)?;
        if bias.len() != p.out_channels as usize {
            return Err(geometry(
                node,
                format!(
                    "bias '{}' has {} elements, expected {}",
                    bias.name,
                    bias.len(),
                    p.out_channels
                ),
            ));
        }
    }

    let (h, w) = x.spatial().unwrap_or_default();
    let extent = |v| {
        if transposed {
            transposed_output(v, p.kernel, p.stride, p.padding)
        } else {
            window_output(v, p.kernel, p.stride, p.padding)
        }
    };
    match (extent(h), extent(w)) {
        (Some(oh), Some(ow)) => Ok(TensorShape::chw(p.out_channels, oh, ow)),
        _ => Err(geometry(
            node,
            format!(
                "kernel {} / stride {} / padding {} does not fit input {x}",
                p.kernel, p.stride, p.padding
            ),
        )),
    }
}

fn pool_shape(p: &PoolParams, x: &TensorShape, node: &str) -> Result<TensorShape, IrError> {
    let (h, w) = x.spatial().unwrap_or_default();
    match (
        window_output(h, p.kernel, p.stride, p.padding),
        window_output(w, p.kernel, p.stride, p.padding),
    ) {
        (Some(oh), Some(ow)) => Ok(TensorShape::chw(x.channels(), oh, ow)),
        _ => Err(geometry(
            node,
            format!(
                "pool window {} / stride {} / padding {} does not fit input {x}",
                p.kernel, p.stride, p.padding
            ),
        )),
    }
}

fn concat_shape(inputs: &[&TensorShape], axis: usize, node: &str) -> Result<TensorShape, IrError> {
    let Some(first) = inputs.first() else {
        return Err(IrError::Arity {
            node: node.into(),
            expected: 1,
            found: 0,
        });
    };
    if axis >= first.rank() {
        return Err(geometry(node, format!("axis {axis} out of range for {first}")));
    }

    let mut dims = first.dims.clone();
    for other in &inputs[1..] {
        let agrees = other.rank() == first.rank()
            && other
                .dims
                .iter()
                .zip(&first.dims)
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b);
        if !agrees {
            return Err(IrError::ShapeMismatch {
                node: node.into(),
                expected: (*first).clone(),
                found: (*other).clone(),
            });
        }
        dims[axis] += other.dims[axis];
    }
    Ok(TensorShape { dims })
}

fn decode_shape(p: &DecodeParams, x: &TensorShape, node: &str) -> Result<TensorShape, IrError> {
    let (Some(width), Some(rows)) = (p.row_width(), p.rows()) else {
        return Err(geometry(node, "decode table does not fit 32-bit extents"));
    };
    let Some(channels) = p.num_anchors.checked_mul(width) else {
        return Err(geometry(node, "decode channel count overflows"));
    };
    if x.channels() != channels {
        return Err(geometry(
            node,
            format!(
                "decode expects {channels} channels ({} anchors x {width}), found {x}",
                p.num_anchors
            ),
        ));
    }
    if x.spatial() != Some((p.grid_height, p.grid_width)) {
        return Err(geometry(
            node,
            format!(
                "decode grid {}x{} does not match input {x}",
                p.grid_height, p.grid_width
            ),
        ));
    }
    if p.anchors.len() != 2 * p.num_anchors as usize {
        return Err(geometry(
            node,
            format!(
                "{} anchor values for {} anchors",
                p.anchors.len(),
                p.num_anchors
            ),
        ));
    }
    Ok(TensorShape::table(rows, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Activation;

    fn shapes(list: &[TensorShape]) -> Vec<&TensorShape> {
        list.iter().collect()
    }

    fn pool(kernel: u32, padding: u32) -> GraphOp {
        GraphOp::MaxPool2d(PoolParams {
            kernel,
            stride: 1,
            padding,
        })
    }

    #[test]
    fn window_arithmetic() {
        assert_eq!(window_output(608, 3, 2, 1), Some(304));
        assert_eq!(window_output(19, 13, 1, 6), Some(19));
        assert_eq!(window_output(2, 5, 1, 0), None);
        assert_eq!(window_output(8, 3, 0, 1), None);
        assert_eq!(transposed_output(19, 2, 2, 0), Some(38));
        assert_eq!(transposed_output(0, 2, 2, 0), None);
    }

    #[test]
    fn size_preserving_pools() {
        let arena = Arena::new();
        for (h, w) in [(19, 19), (7, 11), (1, 1), (38, 76)] {
            let x = TensorShape::chw(512, h, w);
            for (k, p) in [(5, 2), (9, 4), (13, 6)] {
                let out = infer_shape(&pool(k, p), &[&x], &arena, "pool").unwrap();
                assert_eq!(out, x, "kernel {k} padding {p} on {h}x{w}");
            }
        }
    }

    #[test]
    fn sum_requires_identical_shapes() {
        let arena = Arena::new();
        let list = [TensorShape::chw(64, 8, 8), TensorShape::chw(64, 8, 4)];
        let err = infer_shape(&GraphOp::Add, &shapes(&list), &arena, "ew7").unwrap_err();
        match err {
            IrError::ShapeMismatch { node, .. } => assert_eq!(node, "ew7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn concat_sums_axis_and_checks_the_rest() {
        let arena = Arena::new();
        let op = GraphOp::Concat { axis: 0 };
        let ok = [TensorShape::chw(64, 8, 8), TensorShape::chw(32, 8, 8)];
        assert_eq!(
            infer_shape(&op, &shapes(&ok), &arena, "cat").unwrap(),
            TensorShape::chw(96, 8, 8)
        );

        let bad = [TensorShape::chw(64, 8, 8), TensorShape::chw(32, 4, 4)];
        assert!(matches!(
            infer_shape(&op, &shapes(&bad), &arena, "cat"),
            Err(IrError::ShapeMismatch { .. })
        ));

        let tables = [TensorShape::table(3, 10), TensorShape::table(5, 10)];
        assert_eq!(
            infer_shape(&op, &shapes(&tables), &arena, "merge").unwrap(),
            TensorShape::table(8, 10)
        );
    }

    #[test]
    fn conv_rejects_wrong_weight_count() {
        let mut arena = Arena::new();
        let weight = arena.append(Constant::derived("w", vec![8], vec![0.0; 8]));
        let op = GraphOp::Conv2d(ConvParams {
            out_channels: 4,
            kernel: 1,
            stride: 1,
            padding: 0,
            groups: 1,
            weight,
            bias: None,
        });
        let x = TensorShape::chw(3, 8, 8);
        let err = infer_shape(&op, &[&x], &arena, "conv").unwrap_err();
        assert!(err.to_string().contains("expected 12"));
    }

    #[test]
    fn grouped_transposed_conv_doubles_extent() {
        let mut arena = Arena::new();
        let weight = arena.append(Constant::derived("k", vec![256, 1, 2, 2], vec![1.0; 1024]));
        let op = GraphOp::ConvTranspose2d(ConvParams {
            out_channels: 256,
            kernel: 2,
            stride: 2,
            padding: 0,
            groups: 256,
            weight,
            bias: None,
        });
        let x = TensorShape::chw(256, 19, 19);
        assert_eq!(
            infer_shape(&op, &[&x], &arena, "up").unwrap(),
            TensorShape::chw(256, 38, 38)
        );
    }

    #[test]
    fn decode_checks_channels_and_grid() {
        let arena = Arena::new();
        let params = DecodeParams {
            grid_width: 19,
            grid_height: 19,
            num_anchors: 3,
            num_classes: 5,
            input_multiplier: 32,
            anchors: vec![142.0, 110.0, 192.0, 243.0, 459.0, 401.0],
            scale_xy: 1.05,
            new_coords: 0,
        };
        let op = GraphOp::DetectionDecode(params);
        let x = TensorShape::chw(30, 19, 19);
        assert_eq!(
            infer_shape(&op, &[&x], &arena, "yolo").unwrap(),
            TensorShape::table(19 * 19 * 3, 10)
        );

        let wrong_grid = TensorShape::chw(30, 38, 38);
        assert!(infer_shape(&op, &[&wrong_grid], &arena, "yolo").is_err());
        let wrong_channels = TensorShape::chw(24, 19, 19);
        assert!(infer_shape(&op, &[&wrong_channels], &arena, "yolo").is_err());
    }

    #[test]
    fn decode_rejects_oversized_grid() {
        let arena = Arena::new();
        let params = DecodeParams {
            grid_width: 1 << 17,
            grid_height: 1 << 17,
            num_anchors: 3,
            num_classes: 5,
            input_multiplier: 8,
            anchors: vec![12.0, 16.0, 19.0, 36.0, 40.0, 28.0],
            scale_xy: 1.2,
            new_coords: 0,
        };
        assert_eq!(params.rows(), None);
        let x = TensorShape::chw(30, 1 << 17, 1 << 17);
        let err = infer_shape(&GraphOp::DetectionDecode(params), &[&x], &arena, "yolo").unwrap_err();
        assert!(matches!(err, IrError::InvalidGeometry { .. }), "{err}");
    }

    #[test]
    fn activation_arity() {
        let arena = Arena::new();
        let op = GraphOp::Activation(Activation::Softplus);
        let err = infer_shape(&op, &[], &arena, "sp").unwrap_err();
        assert!(matches!(err, IrError::Arity { expected: 1, found: 0, .. }));
    }
}
