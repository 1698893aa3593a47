//! Convolutional building blocks over `[B, C, N]` point features.
//!
//! - [`ResidualBlock`]: GroupNorm/SiLU/Conv1d ×2 with time conditioning and shortcut
//! - [`Downsample`]: stride-2 Conv1d, `N → ⌈N/2⌉`
//! - [`Upsample`]: nearest ×2 + Conv1d, `N → 2N`
//! - [`match_length`]: deterministic nearest resize of the point axis

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, GroupNorm, Linear, VarBuilder};

/// GroupNorm epsilon used throughout the network.
pub const GROUP_NORM_EPS: f64 = 1e-5;

fn conv3(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv1d(in_channels, out_channels, 3, cfg, vb)
}

// ---------------------------------------------------------------------------
// ResidualBlock
// ---------------------------------------------------------------------------

/// Residual block conditioned on the time embedding.
///
/// ```text
/// h = Conv3(SiLU(GN(x)))                  in → out
/// h = h + Linear(SiLU(temb))[:, :, None]
/// h = Conv3(SiLU(GN(h)))                  out → out
/// y = h + shortcut(x)                     identity or Conv1(in → out)
/// ```
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    norm1: GroupNorm,
    conv1: Conv1d,
    time_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv1d,
    shortcut: Option<Conv1d>,
}

impl ResidualBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = candle_nn::group_norm(groups, in_channels, GROUP_NORM_EPS, vb.pp("norm1"))?;
        let conv1 = conv3(in_channels, out_channels, 1, vb.pp("conv1"))?;
        let time_proj = candle_nn::linear(time_emb_dim, out_channels, vb.pp("time_proj"))?;
        let norm2 = candle_nn::group_norm(groups, out_channels, GROUP_NORM_EPS, vb.pp("norm2"))?;
        let conv2 = conv3(out_channels, out_channels, 1, vb.pp("conv2"))?;
        let shortcut = if in_channels != out_channels {
            Some(candle_nn::conv1d(
                in_channels,
                out_channels,
                1,
                Conv1dConfig::default(),
                vb.pp("shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            time_proj,
            norm2,
            conv2,
            shortcut,
        })
    }

    /// `x`: `[B, in, N]`, `temb`: `[B, time_emb_dim]` → `[B, out, N]`.
    pub fn forward(&self, x: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let h = self.norm1.forward(x)?.silu()?.apply(&self.conv1)?;

        // [B, out] → [B, out, 1], broadcast over points
        let t = temb.silu()?.apply(&self.time_proj)?.unsqueeze(D::Minus1)?;
        let h = h.broadcast_add(&t)?;

        let h = self.norm2.forward(&h)?.silu()?.apply(&self.conv2)?;
        match &self.shortcut {
            Some(proj) => h + proj.forward(x)?,
            None => h + x,
        }
    }
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Halve the point axis with a stride-2 convolution.
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv1d,
}

impl Downsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3(channels, channels, 2, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

/// Double the point axis: nearest-neighbour repeat, then a smoothing convolution.
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Conv1d,
}

impl Upsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3(channels, channels, 1, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let n = xs.dim(D::Minus1)?;
        xs.upsample_nearest1d(n * 2)?.apply(&self.conv)
    }
}

/// Resample a `[B, C, N]` tensor to `[B, C, len]` by nearest-neighbour index
/// selection (`src = ⌊dst · N / len⌋`).
///
/// Returns the input unchanged when the lengths already agree.
pub fn match_length(xs: &Tensor, len: usize) -> Result<Tensor> {
    let n = xs.dim(D::Minus1)?;
    if n == len {
        return Ok(xs.clone());
    }
    let idx: Vec<u32> = (0..len)
        .map(|dst| ((dst * n) / len).min(n - 1) as u32)
        .collect();
    let idx = Tensor::new(idx.as_slice(), xs.device())?;
    xs.contiguous()?.index_select(&idx, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn residual_block_changes_width_preserves_points() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ResidualBlock::new(16, 32, 8, 8, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 16, 24), &device).unwrap();
        let temb = Tensor::randn(0.0_f32, 1.0, (2, 8), &device).unwrap();
        let out = block.forward(&x, &temb).unwrap();
        assert_eq!(out.dims(), &[2, 32, 24]);
    }

    #[test]
    fn residual_block_identity_shortcut() {
        let device = Device::Cpu;
        // All-zero weights: both convs output zero, so y = shortcut(x) = x.
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResidualBlock::new(16, 16, 8, 4, vb).unwrap();
        assert!(block.shortcut.is_none());
        let x = Tensor::randn(0.0_f32, 1.0, (1, 16, 10), &device).unwrap();
        let temb = Tensor::randn(0.0_f32, 1.0, (1, 8), &device).unwrap();
        let out = block.forward(&x, &temb).unwrap();
        let diff: f32 = (out - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6, "diff = {diff}");
    }

    #[test]
    fn downsample_halves_rounding_up() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = Downsample::new(8, vb).unwrap();
        for (n, expected) in [(32, 16), (25, 13), (1, 1)] {
            let x = Tensor::randn(0.0_f32, 1.0, (1, 8, n), &device).unwrap();
            assert_eq!(down.forward(&x).unwrap().dims(), &[1, 8, expected]);
        }
    }

    #[test]
    fn upsample_doubles() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = Upsample::new(8, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 8, 13), &device).unwrap();
        assert_eq!(up.forward(&x).unwrap().dims(), &[2, 8, 26]);
    }

    #[test]
    fn match_length_nearest_indices() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 6.0, &device)
            .unwrap()
            .reshape((1, 1, 6))
            .unwrap();
        let shrunk = match_length(&x, 4).unwrap();
        // src = floor(dst * 6 / 4) = [0, 1, 3, 4]
        assert_eq!(shrunk.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 1.0, 3.0, 4.0]);

        let grown = match_length(&x, 8).unwrap();
        // src = floor(dst * 6 / 8) = [0, 0, 1, 2, 3, 3, 4, 5]
        assert_eq!(
            grown.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 0.0, 1.0, 2.0, 3.0, 3.0, 4.0, 5.0]
        );
    }

    #[test]
    fn match_length_same_length_is_noop() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0_f32, 1.0, (2, 4, 9), &device).unwrap();
        let y = match_length(&x, 9).unwrap();
        assert_eq!(y.dims(), x.dims());
    }
}
