//! Build configuration.
//!
//! Everything that varies between builds of the same topology: input
//! geometry, class count, head anchors, precision and the numeric constants
//! of the fused layers. Stored on disk as JSON.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use yolo_backend_core::{BackendOptions, Precision};

use crate::BuildError;

/// Anchors predicted per grid cell at every scale.
pub const NUM_ANCHORS: u32 = 3;

/// `(width, height)` anchor boxes in input pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorSet(pub Vec<[f32; 2]>);

impl AnchorSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Anchors as `w0, h0, w1, h1, ...`.
    pub fn flattened(&self) -> Vec<f32> {
        self.0.iter().flatten().copied().collect()
    }
}

/// One detection scale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionHeadConfig {
    /// Input resolution divided by this head's grid resolution.
    pub stride: u32,
    pub anchors: AnchorSet,
    /// Box-centre sensitivity factor.
    pub scale_xy: f32,
    /// Coordinate encoding version handed to the decode primitive.
    #[serde(default)]
    pub new_coords: u32,
}

impl DetectionHeadConfig {
    fn new(stride: u32, anchors: [[f32; 2]; 3], scale_xy: f32) -> Self {
        Self {
            stride,
            anchors: AnchorSet(anchors.to_vec()),
            scale_xy,
            new_coords: 0,
        }
    }
}

/// Parameters of one network build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub input_channels: u32,
    pub num_classes: u32,
    pub precision: Precision,
    /// Epsilon added to the running variance before normalization.
    pub bn_eps: f32,
    /// Negative slope of the leaky rectifier.
    pub leaky_slope: f32,
    pub input_name: String,
    pub output_name: String,
    /// Detection scales, finest first.
    pub heads: Vec<DetectionHeadConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            input_width: 608,
            input_height: 608,
            input_channels: 3,
            num_classes: 5,
            precision: Precision::Full,
            bn_eps: 1e-4,
            leaky_slope: 0.1,
            input_name: "input".into(),
            output_name: "detections".into(),
            heads: vec![
                DetectionHeadConfig::new(8, [[12.0, 16.0], [19.0, 36.0], [40.0, 28.0]], 1.2),
                DetectionHeadConfig::new(16, [[36.0, 75.0], [76.0, 55.0], [72.0, 146.0]], 1.1),
                DetectionHeadConfig::new(
                    32,
                    [[142.0, 110.0], [192.0, 243.0], [459.0, 401.0]],
                    1.05,
                ),
            ],
        }
    }
}

impl BuildConfig {
    /// Read a JSON config. Missing fields take their default values.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| BuildError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| BuildError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config as pretty-printed JSON.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), BuildError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).map_err(|source| BuildError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text + "\n").map_err(|source| BuildError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the count and geometry invariants a build relies on.
    pub fn validate(&self) -> Result<(), BuildError> {
        let invalid = |msg: String| Err(BuildError::InvalidConfig(msg));

        if self.input_width == 0 || self.input_height == 0 || self.input_channels == 0 {
            return invalid(format!(
                "input geometry {}x{}x{} has a zero extent",
                self.input_channels, self.input_height, self.input_width
            ));
        }
        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".into());
        }
        if self
            .num_classes
            .checked_add(5)
            .and_then(|w| w.checked_mul(NUM_ANCHORS))
            .is_none()
        {
            return invalid(format!("num_classes {} is too large", self.num_classes));
        }
        if !(self.bn_eps.is_finite() && self.bn_eps > 0.0) {
            return invalid(format!("bn_eps must be positive, got {}", self.bn_eps));
        }
        if !self.leaky_slope.is_finite() {
            return invalid(format!("leaky_slope must be finite, got {}", self.leaky_slope));
        }
        if self.input_name.is_empty() || self.output_name.is_empty() {
            return invalid("tensor names must not be empty".into());
        }
        if self.input_name == self.output_name {
            return invalid(format!(
                "input and output share the name '{}'",
                self.input_name
            ));
        }
        if self.heads.len() != 3 {
            return invalid(format!("expected 3 detection heads, got {}", self.heads.len()));
        }

        let mut previous = 0;
        for (i, head) in self.heads.iter().enumerate() {
            if head.stride <= previous {
                return invalid(format!(
                    "head {i}: strides must increase (stride {} after {previous})",
                    head.stride
                ));
            }
            previous = head.stride;
            if self.input_width % head.stride != 0 || self.input_height % head.stride != 0 {
                return invalid(format!(
                    "head {i}: input {}x{} is not divisible by stride {}",
                    self.input_height, self.input_width, head.stride
                ));
            }
            if head.anchors.len() != NUM_ANCHORS as usize {
                return invalid(format!(
                    "head {i}: expected {NUM_ANCHORS} anchors, got {}",
                    head.anchors.len()
                ));
            }
            if head.anchors.flattened().iter().any(|v| !(v.is_finite() && *v > 0.0)) {
                return invalid(format!("head {i}: anchor extents must be positive"));
            }
            if !(head.scale_xy.is_finite() && head.scale_xy > 0.0) {
                return invalid(format!(
                    "head {i}: scale_xy must be positive, got {}",
                    head.scale_xy
                ));
            }
        }
        if self.total_detections().is_none() {
            return invalid(format!(
                "input {}x{} yields more than {} detection rows",
                self.input_height,
                self.input_width,
                u32::MAX
            ));
        }
        Ok(())
    }

    /// `(height, width)` of a head's grid.
    pub fn grid_size(&self, head: &DetectionHeadConfig) -> (u32, u32) {
        (self.input_height / head.stride, self.input_width / head.stride)
    }

    /// Channels of every head projection: `anchors * (classes + 5)`.
    /// Saturates for class counts [`validate`](Self::validate) rejects.
    pub fn head_channels(&self) -> u32 {
        NUM_ANCHORS.saturating_mul(self.row_width())
    }

    /// Width of one output row.
    pub fn row_width(&self) -> u32 {
        self.num_classes.saturating_add(5)
    }

    /// Rows of the merged output table, or `None` if the count does not
    /// fit a `u32` (or a head has a zero stride).
    pub fn total_detections(&self) -> Option<u32> {
        self.heads.iter().try_fold(0u32, |total, head| {
            let h = self.input_height.checked_div(head.stride)?;
            let w = self.input_width.checked_div(head.stride)?;
            h.checked_mul(w)?.checked_mul(NUM_ANCHORS)?.checked_add(total)
        })
    }

    /// Options for the engine compiler.
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            precision: self.precision,
            ..BackendOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let config = BuildConfig::default();
        config.validate().unwrap();
        let grids: Vec<_> = config.heads.iter().map(|h| config.grid_size(h)).collect();
        assert_eq!(grids, vec![(76, 76), (38, 38), (19, 19)]);
        assert_eq!(config.head_channels(), 30);
        assert_eq!(config.total_detections(), Some(22743));
    }

    #[test]
    fn rectangular_input() {
        let config = BuildConfig {
            input_width: 416,
            input_height: 320,
            num_classes: 80,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.grid_size(&config.heads[2]), (10, 13));
        assert_eq!(config.head_channels(), 255);
        assert_eq!(config.total_detections(), Some(3 * (40 * 52 + 20 * 26 + 10 * 13)));
    }

    #[test]
    fn rejects_indivisible_input() {
        let config = BuildConfig {
            input_width: 600,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not divisible by stride"));
    }

    #[test]
    fn rejects_inputs_whose_row_count_overflows() {
        let config = BuildConfig {
            input_width: 1 << 20,
            input_height: 1 << 20,
            ..Default::default()
        };
        assert_eq!(config.total_detections(), None);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)), "{err}");
        assert!(err.to_string().contains("detection rows"));

        let config = BuildConfig {
            num_classes: u32::MAX - 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BuildError::InvalidConfig(_))));
        assert_eq!(config.row_width(), u32::MAX);
    }

    #[test]
    fn rejects_bad_counts() {
        let mut config = BuildConfig {
            num_classes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.num_classes = 5;
        config.heads[1].anchors.0.pop();
        assert!(config.validate().unwrap_err().to_string().contains("head 1"));

        let mut config = BuildConfig::default();
        config.heads.swap(0, 2);
        assert!(config.validate().unwrap_err().to_string().contains("increase"));

        let config = BuildConfig {
            bn_eps: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        let config = BuildConfig {
            num_classes: 80,
            precision: Precision::Reduced,
            ..Default::default()
        };
        config.save_to_path(&path).unwrap();
        assert_eq!(BuildConfig::load_from_path(&path).unwrap(), config);

        fs::write(&path, r#"{ "num_classes": 2, "input_width": 416, "input_height": 416 }"#)
            .unwrap();
        let partial = BuildConfig::load_from_path(&path).unwrap();
        assert_eq!(partial.num_classes, 2);
        assert_eq!(partial.heads.len(), 3);
        assert_eq!(partial.bn_eps, 1e-4);
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = BuildConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, BuildError::ConfigFormat { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn backend_options_follow_precision() {
        let config = BuildConfig {
            precision: Precision::Reduced,
            ..Default::default()
        };
        let opts = config.backend_options();
        assert_eq!(opts.precision, Precision::Reduced);
        assert_eq!(opts.max_batch_size, 1);
    }
}
