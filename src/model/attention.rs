//! Multi-head self-attention over the point axis.
//!
//! Every point attends to every other point of the same cloud, so the cost is
//! `O(N²·C)` per sample. The U-Net only pays this at full width on the first
//! level; deeper levels see a pooled point axis.

use candle_core::{D, Module, Tensor};
use candle_nn::{GroupNorm, VarBuilder};

use super::blocks::GROUP_NORM_EPS;
use crate::Result;

/// GroupNorm → multi-head scaled dot-product self-attention → residual add.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    norm: GroupNorm,
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl AttentionBlock {
    pub fn new(channels: usize, num_heads: usize, groups: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || channels % num_heads != 0 {
            return Err(crate::Error::Config(format!(
                "{num_heads} attention heads do not divide {channels} channels"
            )));
        }
        let norm = candle_nn::group_norm(groups, channels, GROUP_NORM_EPS, vb.pp("norm"))?;
        let to_q = candle_nn::linear(channels, channels, vb.pp("to_q"))?;
        let to_k = candle_nn::linear(channels, channels, vb.pp("to_k"))?;
        let to_v = candle_nn::linear(channels, channels, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(channels, channels, vb.pp("to_out"))?;
        Ok(Self {
            norm,
            to_q,
            to_k,
            to_v,
            to_out,
            num_heads,
            head_dim: channels / num_heads,
        })
    }

    /// `x`: `[B, C, N]` → `[B, C, N]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, channels, points) = x.dims3()?;

        // [B, C, N] → [B, N, C]
        let h = self.norm.forward(x)?.transpose(1, 2)?.contiguous()?;

        let q = self.to_q.forward(&h)?;
        let k = self.to_k.forward(&h)?;
        let v = self.to_v.forward(&h)?;

        // Reshape to [B, H, N, D]
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((batch, points, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(q)?;
        let k = split(k)?;
        let v = split(v)?;

        let scale = (self.head_dim as f64).sqrt();

        // Attention scores: Q · K^T / sqrt(d)
        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let out = attn_weights.matmul(&v)?; // [B, H, N, D]

        // [B, H, N, D] → [B, N, C]
        let out = out
            .transpose(1, 2)?
            .reshape((batch, points, channels))?;
        let out = self.to_out.forward(&out)?;

        // [B, N, C] → [B, C, N]
        let out = out.transpose(1, 2)?;
        Ok((x + out)?)
    }
}
