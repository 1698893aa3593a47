//! Configuration for the point-cloud diffusion model and its training loop.
//!
//! Defaults describe the standard point-cloud U-Net: a 1000-step cosine
//! schedule, 64 base channels, multipliers `(1, 2, 4, 8)`, 128-wide time
//! embedding, 4 attention heads and 8 GroupNorm groups.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Model + schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of diffusion timesteps `T`.
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,

    /// Cosine schedule offset `s`.
    #[serde(default = "default_schedule_shift")]
    pub schedule_shift: f64,

    /// Width of the first resolution level.
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,

    /// Per-level channel multipliers; level `i` has `base_channels * mult[i]`.
    #[serde(default = "default_channel_multipliers")]
    pub channel_multipliers: Vec<usize>,

    /// Sinusoidal time embedding width (even, at least 4).
    #[serde(default = "default_time_embedding_dim")]
    pub time_embedding_dim: usize,

    /// Heads in every attention block.
    #[serde(default = "default_attention_heads")]
    pub attention_heads: usize,

    /// GroupNorm group count; must divide every normalized width.
    #[serde(default = "default_group_norm_groups")]
    pub group_norm_groups: usize,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: default_timesteps(),
            schedule_shift: default_schedule_shift(),
            base_channels: default_base_channels(),
            channel_multipliers: default_channel_multipliers(),
            time_embedding_dim: default_time_embedding_dim(),
            attention_heads: default_attention_heads(),
            group_norm_groups: default_group_norm_groups(),
        }
    }
}

/// Channel plan for one decoder level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderWidths {
    /// Width of the tensor arriving from the level below.
    pub input: usize,
    /// Width of the skip tensor popped at this level.
    pub skip: usize,
    /// Width after the level's residual blocks.
    pub output: usize,
}

impl DiffusionConfig {
    /// Number of resolution levels `L`.
    pub fn num_levels(&self) -> usize {
        self.channel_multipliers.len()
    }

    /// Point-count divisor that keeps down/up-sampling exactly reversible: `2^(L-1)`.
    pub fn resampling_factor(&self) -> usize {
        let shift = self.num_levels().saturating_sub(1) as u32;
        1usize.checked_shl(shift).unwrap_or(usize::MAX)
    }

    /// Encoder widths, one per level.
    pub fn level_widths(&self) -> Vec<usize> {
        self.channel_multipliers
            .iter()
            .map(|m| self.base_channels * m)
            .collect()
    }

    /// Width at the deepest level (bottleneck).
    pub fn bottleneck_width(&self) -> usize {
        self.level_widths()
            .last()
            .copied()
            .unwrap_or(self.base_channels)
    }

    /// Decoder channel plan, deepest level first.
    pub fn decoder_widths(&self) -> Vec<DecoderWidths> {
        let widths = self.level_widths();
        let levels = widths.len();
        let mut input = self.bottleneck_width();
        let mut plan = Vec::with_capacity(levels);
        for j in 0..levels {
            let skip = widths[levels - 1 - j];
            let output = if j + 1 < levels {
                widths[levels - 2 - j]
            } else {
                self.base_channels
            };
            plan.push(DecoderWidths {
                input,
                skip,
                output,
            });
            input = output;
        }
        plan
    }

    /// Check every constraint the network and schedule rely on.
    pub fn validate(&self) -> Result<()> {
        if self.timesteps == 0 {
            return Err(Error::Config("timesteps must be > 0".into()));
        }
        if !self.schedule_shift.is_finite() || self.schedule_shift < 0.0 {
            return Err(Error::Config(format!(
                "schedule_shift must be finite and >= 0, got {}",
                self.schedule_shift
            )));
        }
        if self.base_channels == 0 {
            return Err(Error::Config("base_channels must be > 0".into()));
        }
        if self.channel_multipliers.is_empty() {
            return Err(Error::Config("channel_multipliers must not be empty".into()));
        }
        if self.channel_multipliers.len() > usize::BITS as usize {
            return Err(Error::Config(format!(
                "at most {} resolution levels are supported, got {}",
                usize::BITS,
                self.channel_multipliers.len()
            )));
        }
        if let Some(m) = self.channel_multipliers.iter().find(|m| **m == 0) {
            return Err(Error::Config(format!(
                "channel multipliers must be >= 1, got {m}"
            )));
        }
        if self.time_embedding_dim < 4 || self.time_embedding_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "time_embedding_dim must be even and >= 4, got {}",
                self.time_embedding_dim
            )));
        }
        if self.attention_heads == 0 {
            return Err(Error::Config("attention_heads must be > 0".into()));
        }
        if self.group_norm_groups == 0 {
            return Err(Error::Config("group_norm_groups must be > 0".into()));
        }

        // Attention runs at every encoder width and every decoder output width.
        let mut attention_widths = self.level_widths();
        attention_widths.push(self.base_channels);
        for width in &attention_widths {
            if width % self.attention_heads != 0 {
                return Err(Error::Config(format!(
                    "attention_heads ({}) must divide channel width {width}",
                    self.attention_heads
                )));
            }
        }

        // GroupNorm sees every block input, including concatenated decoder inputs.
        let mut norm_widths = attention_widths;
        for level in self.decoder_widths() {
            norm_widths.push(level.input + level.skip);
            norm_widths.push(level.output);
        }
        for width in &norm_widths {
            if width % self.group_norm_groups != 0 {
                return Err(Error::Config(format!(
                    "group_norm_groups ({}) must divide channel width {width}",
                    self.group_norm_groups
                )));
            }
        }
        Ok(())
    }
}

fn default_timesteps() -> usize {
    1000
}
fn default_schedule_shift() -> f64 {
    0.008
}
fn default_base_channels() -> usize {
    64
}
fn default_channel_multipliers() -> Vec<usize> {
    vec![1, 2, 4, 8]
}
fn default_time_embedding_dim() -> usize {
    128
}
fn default_attention_heads() -> usize {
    4
}
fn default_group_norm_groups() -> usize {
    8
}

/// Training loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Full passes over the batch source.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Point clouds per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// AdamW learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Seed for timestep/noise draws and batch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            seed: default_seed(),
        }
    }
}

fn default_epochs() -> usize {
    5
}
fn default_batch_size() -> usize {
    16
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_weight_decay() -> f64 {
    0.0
}
fn default_seed() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = DiffusionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_levels(), 4);
        assert_eq!(cfg.resampling_factor(), 8);
        assert_eq!(cfg.level_widths(), vec![64, 128, 256, 512]);
        assert_eq!(cfg.bottleneck_width(), 512);
    }

    #[test]
    fn decoder_plan_mirrors_encoder() {
        let cfg = DiffusionConfig::default();
        let plan = cfg.decoder_widths();
        assert_eq!(
            plan,
            vec![
                DecoderWidths { input: 512, skip: 512, output: 256 },
                DecoderWidths { input: 256, skip: 256, output: 128 },
                DecoderWidths { input: 128, skip: 128, output: 64 },
                DecoderWidths { input: 64, skip: 64, output: 64 },
            ]
        );
    }

    #[test]
    fn rejects_indivisible_group_norm() {
        let cfg = DiffusionConfig {
            base_channels: 12,
            group_norm_groups: 8,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn rejects_odd_time_embedding() {
        let cfg = DiffusionConfig {
            time_embedding_dim: 7,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_timesteps_and_empty_levels() {
        let cfg = DiffusionConfig {
            timesteps: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = DiffusionConfig {
            channel_multipliers: vec![],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_too_many_levels() {
        let config = DiffusionConfig {
            channel_multipliers: vec![1; usize::BITS as usize + 1],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(config.resampling_factor(), usize::MAX);
    }

    #[test]
    fn rejects_heads_not_dividing_width() {
        let cfg = DiffusionConfig {
            base_channels: 8,
            attention_heads: 3,
            group_norm_groups: 4,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn deserialize_from_json() {
        let json = r#"{"timesteps": 50, "channel_multipliers": [1, 2]}"#;
        let cfg: DiffusionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.timesteps, 50);
        assert_eq!(cfg.channel_multipliers, vec![1, 2]);
        // Unspecified fields should use defaults.
        assert_eq!(cfg.base_channels, 64);
        assert_eq!(cfg.group_norm_groups, 8);
    }

    #[test]
    fn train_config_defaults() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.epochs, 5);
        assert!((cfg.learning_rate - 1e-4).abs() < 1e-12);
    }
}
