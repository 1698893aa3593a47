//! Sinusoidal timestep embedding for diffusion conditioning.
//!
//! Converts integer timesteps to the conditioning vector every residual block
//! consumes:
//! sinusoidal encoding `[sin(t·f), cos(t·f)]` → Linear → SiLU → Linear.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

/// Timestep embedding: fixed sinusoidal features followed by a two-layer MLP.
#[derive(Debug, Clone)]
pub struct TimeEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    dim: usize,
}

impl TimeEmbedding {
    /// Create a new time embedding of width `dim` (even, at least 4).
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(dim, dim, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(dim, dim, vb.pp("linear_2"))?;
        Ok(Self {
            linear_1,
            linear_2,
            dim,
        })
    }

    /// Output width.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Sinusoidal encoding of raw timesteps.
    ///
    /// `t`: `[B]` (any numeric dtype) → `[B, dim]` `f32`.
    pub fn sinusoidal(t: &Tensor, dim: usize, dev: &Device) -> Result<Tensor> {
        let half = dim / 2;
        let max_period: f64 = 10000.0;

        // freqs = exp(-ln(max_period) * k / (half - 1))
        let freqs: Vec<f32> = (0..half)
            .map(|k| (-(max_period.ln()) * k as f64 / (half - 1) as f64).exp() as f32)
            .collect();
        let freqs = Tensor::new(freqs.as_slice(), dev)?;

        // args = t[:, None] * freqs[None, :]
        let t_f32 = t.to_dtype(DType::F32)?;
        let args = t_f32.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;

        Tensor::cat(&[&args.sin()?, &args.cos()?], 1)
    }

    /// Forward pass: t `[B]` → conditioning vector `[B, dim]`.
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        Self::sinusoidal(t, self.dim, t.device())?
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn embedding_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let te = TimeEmbedding::new(32, vb.pp("te")).unwrap();
        let t = Tensor::new(&[0u32, 17, 999], &dev).unwrap();
        let emb = te.forward(&t).unwrap();
        assert_eq!(emb.dims(), &[3, 32]);
    }

    #[test]
    fn sinusoidal_at_zero_is_sin0_cos0() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[0u32], &dev).unwrap();
        let emb = TimeEmbedding::sinusoidal(&t, 8, &dev).unwrap();
        let values = emb.i(0).unwrap().to_vec1::<f32>().unwrap();
        // First half sin(0) = 0, second half cos(0) = 1.
        assert_eq!(values, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn sinusoidal_frequencies_span_one_to_inverse_max_period() {
        let dev = Device::Cpu;
        // t = 1 makes the arguments equal to the frequencies themselves.
        let t = Tensor::new(&[1u32], &dev).unwrap();
        let emb = TimeEmbedding::sinusoidal(&t, 8, &dev).unwrap();
        let values = emb.i(0).unwrap().to_vec1::<f32>().unwrap();
        // k = 0 → freq 1; k = half-1 → freq 1e-4.
        assert!((values[0] - 1f32.sin()).abs() < 1e-6);
        assert!((values[3] - 1e-4f32.sin()).abs() < 1e-6);
        assert!((values[4] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn sinusoidal_varies_with_timestep() {
        let dev = Device::Cpu;
        let t1 = Tensor::new(&[10u32], &dev).unwrap();
        let t2 = Tensor::new(&[500u32], &dev).unwrap();
        let emb1 = TimeEmbedding::sinusoidal(&t1, 64, &dev).unwrap();
        let emb2 = TimeEmbedding::sinusoidal(&t2, 64, &dev).unwrap();

        // Different timesteps should produce different embeddings
        let diff = (emb1 - emb2).unwrap().abs().unwrap().sum_all().unwrap();
        let diff_val: f32 = diff.to_scalar().unwrap();
        assert!(diff_val > 0.1);
    }
}
