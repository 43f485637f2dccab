//! Batch normalization folded into a per-channel affine transform.
//!
//! At inference time `gamma * (x - mean) / sqrt(var + eps) + beta` is just
//! `scale * x + shift` with
//!
//! ```text
//! scale = gamma / sqrt(var + eps)
//! shift = beta - mean * scale
//! ```
//!
//! and the exponent fixed at 1.

use yolo_weights::NamedWeightMap;

use crate::BuildError;

/// Per-channel coefficients of `y = (scale * x + shift) ^ power`.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedAffine {
    pub scale: Vec<f32>,
    pub shift: Vec<f32>,
    pub power: Vec<f32>,
}

impl FusedAffine {
    /// Fold normalization statistics into affine coefficients.
    ///
    /// The four slices must have the same length and `var + eps` must be
    /// strictly positive for every channel.
    pub fn from_statistics(
        prefix: &str,
        gamma: &[f32],
        beta: &[f32],
        mean: &[f32],
        var: &[f32],
        eps: f32,
    ) -> Result<Self, BuildError> {
        let channels = gamma.len();
        for (what, len) in [("bias", beta.len()), ("running_mean", mean.len()), ("running_var", var.len())] {
            if len != channels {
                return Err(BuildError::MissingStatistics {
                    prefix: prefix.into(),
                    reason: format!("{what} has {len} channels, weight has {channels}"),
                });
            }
        }

        let mut scale = Vec::with_capacity(channels);
        let mut shift = Vec::with_capacity(channels);
        for c in 0..channels {
            let denom = var[c] + eps;
            if denom.is_nan() || denom <= 0.0 {
                return Err(BuildError::MissingStatistics {
                    prefix: prefix.into(),
                    reason: format!("channel {c}: variance {} + eps is not positive", var[c]),
                });
            }
            let s = gamma[c] / denom.sqrt();
            scale.push(s);
            shift.push(beta[c] - mean[c] * s);
        }

        Ok(Self {
            scale,
            shift,
            power: vec![1.0; channels],
        })
    }

    /// Look up `<prefix>.{weight,bias,running_mean,running_var}` and fold them.
    pub fn from_weights(weights: &NamedWeightMap, prefix: &str, eps: f32) -> Result<Self, BuildError> {
        let [gamma, beta, mean, var] = statistic_keys(prefix).map(|key| {
            weights
                .get(&key)
                .map(|t| t.values())
                .ok_or(BuildError::MissingWeight { key })
        });
        Self::from_statistics(prefix, gamma?, beta?, mean?, var?, eps)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.scale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scale.is_empty()
    }

    /// Apply the transform to one value of channel `c`.
    pub fn apply(&self, c: usize, x: f32) -> f32 {
        (self.scale[c] * x + self.shift[c]).powf(self.power[c])
    }
}

/// The four statistic keys under a normalization prefix, in
/// `weight, bias, running_mean, running_var` order.
pub fn statistic_keys(prefix: &str) -> [String; 4] {
    ["weight", "bias", "running_mean", "running_var"].map(|field| format!("{prefix}.{field}"))
}
