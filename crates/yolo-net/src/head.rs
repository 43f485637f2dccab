//! Detection heads: per-scale projection, decode and the final merge.

use yolo_ir::{DecodeParams, EdgeId};

use crate::block::{ConvSpec, NetBuilder};
use crate::config::NUM_ANCHORS;
use crate::{BuildConfig, BuildError, DetectionHeadConfig};

/// Builds the three detection heads of a network.
#[derive(Clone, Copy, Debug)]
pub struct DetectionHeadBuilder<'c> {
    config: &'c BuildConfig,
}

impl<'c> DetectionHeadBuilder<'c> {
    pub fn new(config: &'c BuildConfig) -> Self {
        Self { config }
    }

    /// Decode parameters for one head.
    pub fn decode_params(&self, head: &DetectionHeadConfig) -> DecodeParams {
        let (grid_height, grid_width) = self.config.grid_size(head);
        DecodeParams {
            grid_width,
            grid_height,
            num_anchors: NUM_ANCHORS,
            num_classes: self.config.num_classes,
            input_multiplier: head.stride,
            anchors: head.anchors.flattened(),
            scale_xy: head.scale_xy,
            new_coords: head.new_coords,
        }
    }

    /// Project `features` to `anchors * (classes + 5)` channels with the
    /// biased 1x1 convolution of layer `index`, then decode it into a
    /// `[grid_h * grid_w * anchors, classes + 5]` table.
    pub fn build(
        &self,
        net: &mut NetBuilder<'_>,
        features: EdgeId,
        head: usize,
        index: u32,
        name: &str,
    ) -> Result<EdgeId, BuildError> {
        let cfg = self.config.heads.get(head).ok_or_else(|| {
            BuildError::InvalidConfig(format!(
                "'{name}' uses head {head} but only {} are configured",
                self.config.heads.len()
            ))
        })?;
        let projection = ConvSpec::pointwise(self.config.head_channels());
        let projected = net.conv(features, projection, index, true)?;
        let params = self.decode_params(cfg);
        log::debug!(
            "{name}: {}x{} grid, stride {}, anchors {:?}",
            params.grid_height,
            params.grid_width,
            cfg.stride,
            params.anchors
        );
        net.decode(projected, params, name)
    }

    /// Concatenate decoded tables row-wise, finest scale first.
    pub fn merge(
        &self,
        net: &mut NetBuilder<'_>,
        heads: &[EdgeId],
        name: &str,
    ) -> Result<EdgeId, BuildError> {
        net.concat(heads, name)
    }
}
