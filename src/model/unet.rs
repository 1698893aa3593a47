//! 1-D U-Net noise predictor over point clouds.
//!
//! ## Architecture (default config)
//!
//! ```text
//! [B, 3, N] ─→ Conv1d(3, 64, 3)
//!   ─→ level 0: 2× Res(64)  + Attn ─ skip ─→ Down      [B,  64, N/2]
//!   ─→ level 1: 2× Res(128) + Attn ─ skip ─→ Down      [B, 128, N/4]
//!   ─→ level 2: 2× Res(256) + Attn ─ skip ─→ Down      [B, 256, N/8]
//!   ─→ level 3: 2× Res(512) + Attn ─ skip              [B, 512, N/8]
//!   ─→ bottleneck: 2× Res(512) + Attn + 2× Res(512)
//!   ─→ up 0:        cat(skip3) + 2× Res(1024→256) + Attn
//!   ─→ up 1: Up ─→ cat(skip2) + 2× Res(512→128)  + Attn
//!   ─→ up 2: Up ─→ cat(skip1) + 2× Res(256→64)   + Attn
//!   ─→ up 3: Up ─→ cat(skip0) + 2× Res(128→64)   + Attn  [B, 64, N]
//!   ─→ GroupNorm + SiLU + Conv1d(64, 3, 1)            [B, 3, N]
//! ```
//!
//! Point counts that are not a multiple of `2^(L-1)` round up on every
//! downsample; the decoder then resizes the upsampled tensor to the skip
//! length before concatenation (see [`match_length`]).

use candle_core::{D, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, GroupNorm, VarBuilder};

use super::Denoiser;
use super::attention::AttentionBlock;
use super::blocks::{Downsample, GROUP_NORM_EPS, ResidualBlock, Upsample, match_length};
use super::timestep::TimeEmbedding;
use crate::config::DiffusionConfig;
use crate::{Error, Result};

/// Input/output channel count (x, y, z).
pub const POINT_CHANNELS: usize = 3;

/// Change of point-axis length.
#[derive(Debug, Clone)]
pub enum Resample {
    Down(Downsample),
    Up(Upsample),
}

/// One entry of a level's layer sequence.
#[derive(Debug, Clone)]
pub enum Layer {
    Residual(ResidualBlock),
    Attention(AttentionBlock),
    Resample(Resample),
}

impl Layer {
    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Residual(block) => Ok(block.forward(xs, temb)?),
            Layer::Attention(block) => block.forward(xs),
            Layer::Resample(Resample::Down(down)) => Ok(down.forward(xs)?),
            Layer::Resample(Resample::Up(up)) => Ok(up.forward(xs)?),
        }
    }
}

/// Decoder level: the concat point sits between the upsample and the blocks.
#[derive(Debug, Clone)]
struct DecoderLevel {
    upsample: Option<Layer>,
    layers: Vec<Layer>,
}

/// Point-cloud U-Net predicting `ε` from `(x_t, t)`.
#[derive(Debug, Clone)]
pub struct PointUNet {
    time_mlp: TimeEmbedding,
    init_conv: Conv1d,
    /// Encoder levels; every level but the deepest ends in a downsample.
    encoder: Vec<Vec<Layer>>,
    bottleneck: Vec<Layer>,
    decoder: Vec<DecoderLevel>,
    final_norm: GroupNorm,
    final_conv: Conv1d,
    resampling_factor: usize,
}

impl PointUNet {
    /// Build the network, creating or loading every parameter through `vb`.
    pub fn new(config: &DiffusionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let emb = config.time_embedding_dim;
        let groups = config.group_norm_groups;
        let heads = config.attention_heads;
        let widths = config.level_widths();
        let levels = widths.len();

        let time_mlp = TimeEmbedding::new(emb, vb.pp("time_mlp"))?;
        let cfg3 = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let init_conv = candle_nn::conv1d(
            POINT_CHANNELS,
            config.base_channels,
            3,
            cfg3,
            vb.pp("init_conv"),
        )?;

        let mut encoder = Vec::with_capacity(levels);
        let mut current = config.base_channels;
        for (i, &width) in widths.iter().enumerate() {
            let vb = vb.pp(format!("downs.{i}"));
            let mut layers = vec![
                Layer::Residual(ResidualBlock::new(current, width, emb, groups, vb.pp("0"))?),
                Layer::Residual(ResidualBlock::new(width, width, emb, groups, vb.pp("1"))?),
                Layer::Attention(AttentionBlock::new(width, heads, groups, vb.pp("2"))?),
            ];
            if i + 1 < levels {
                layers.push(Layer::Resample(Resample::Down(Downsample::new(
                    width,
                    vb.pp("3"),
                )?)));
            }
            encoder.push(layers);
            current = width;
        }

        let vb_mid = vb.pp("mid");
        let bottleneck = vec![
            Layer::Residual(ResidualBlock::new(current, current, emb, groups, vb_mid.pp("0"))?),
            Layer::Residual(ResidualBlock::new(current, current, emb, groups, vb_mid.pp("1"))?),
            Layer::Attention(AttentionBlock::new(current, heads, groups, vb_mid.pp("2"))?),
            Layer::Residual(ResidualBlock::new(current, current, emb, groups, vb_mid.pp("3"))?),
            Layer::Residual(ResidualBlock::new(current, current, emb, groups, vb_mid.pp("4"))?),
        ];

        let mut decoder = Vec::with_capacity(levels);
        for (j, plan) in config.decoder_widths().into_iter().enumerate() {
            let vb = vb.pp(format!("ups.{j}"));
            let upsample = if j == 0 {
                None
            } else {
                Some(Layer::Resample(Resample::Up(Upsample::new(
                    plan.input,
                    vb.pp("0"),
                )?)))
            };
            let concat = plan.input + plan.skip;
            let layers = vec![
                Layer::Residual(ResidualBlock::new(concat, plan.output, emb, groups, vb.pp("1"))?),
                Layer::Residual(ResidualBlock::new(
                    plan.output,
                    plan.output,
                    emb,
                    groups,
                    vb.pp("2"),
                )?),
                Layer::Attention(AttentionBlock::new(plan.output, heads, groups, vb.pp("3"))?),
            ];
            decoder.push(DecoderLevel { upsample, layers });
            current = plan.output;
        }

        let final_norm =
            candle_nn::group_norm(groups, current, GROUP_NORM_EPS, vb.pp("final_norm"))?;
        let final_conv = candle_nn::conv1d(
            current,
            POINT_CHANNELS,
            1,
            Conv1dConfig::default(),
            vb.pp("final_conv"),
        )?;

        Ok(Self {
            time_mlp,
            init_conv,
            encoder,
            bottleneck,
            decoder,
            final_norm,
            final_conv,
            resampling_factor: config.resampling_factor(),
        })
    }
}

impl Denoiser for PointUNet {
    /// `x`: `[B, 3, N]`, `t`: `[B]` → predicted noise `[B, 3, N]`.
    fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        let (batch, channels, _points) = x.dims3()?;
        if channels != POINT_CHANNELS {
            return Err(Error::Shape(format!(
                "expected {POINT_CHANNELS} input channels, got {channels}"
            )));
        }
        let t_len = t.dims1()?;
        if t_len != batch {
            return Err(Error::Shape(format!(
                "got {t_len} timesteps for a batch of {batch}"
            )));
        }

        let temb = self.time_mlp.forward(t)?;
        let mut xs = self.init_conv.forward(x)?;

        // Pushed on the way down, popped on the way up; local to this call.
        let mut skips: Vec<Tensor> = Vec::with_capacity(self.encoder.len());
        for level in &self.encoder {
            for layer in level {
                if let Layer::Resample(_) = layer {
                    skips.push(xs.clone());
                }
                xs = layer.forward(&xs, &temb)?;
            }
        }
        // The deepest level has no downsample; its output is the last skip.
        skips.push(xs.clone());

        for layer in &self.bottleneck {
            xs = layer.forward(&xs, &temb)?;
        }

        for (j, level) in self.decoder.iter().enumerate() {
            if let Some(up) = &level.upsample {
                xs = up.forward(&xs, &temb)?;
            }
            let skip = skips.pop().ok_or_else(|| {
                Error::Shape(format!("skip stack exhausted at decoder level {j}"))
            })?;
            let (have, want) = (xs.dim(D::Minus1)?, skip.dim(D::Minus1)?);
            if have != want {
                tracing::debug!(
                    level = j,
                    from = have,
                    to = want,
                    "resizing upsampled features to skip length"
                );
                xs = match_length(&xs, want)?;
            }
            xs = Tensor::cat(&[&xs, &skip], 1)?;
            for layer in &level.layers {
                xs = layer.forward(&xs, &temb)?;
            }
        }

        let xs = self.final_norm.forward(&xs)?.silu()?;
        Ok(self.final_conv.forward(&xs)?)
    }

    fn resampling_factor(&self) -> usize {
        self.resampling_factor
    }
}
