//! Noise-prediction network for point clouds.
//!
//! ## Components
//!
//! - [`timestep`]: sinusoidal time embedding + MLP
//! - [`blocks`]: time-conditioned residual block, down/up-sampling, length matching
//! - [`attention`]: multi-head self-attention over the point axis
//! - [`unet`]: the multi-resolution encoder/bottleneck/decoder

pub mod attention;
pub mod blocks;
pub mod timestep;
pub mod unet;

use candle_core::Tensor;

use crate::Result;

/// Anything that predicts the noise in `x_t` at timestep `t`.
///
/// The diffusion process only ever calls [`Denoiser::forward`]; multi-device
/// wrappers implement this trait themselves.
pub trait Denoiser {
    /// `x`: `[B, 3, N]`, `t`: `[B]` integer timesteps → `[B, 3, N]`.
    fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor>;

    /// Point counts must be a multiple of this for down/up-sampling to be
    /// exactly reversible.
    fn resampling_factor(&self) -> usize {
        1
    }
}

impl<T: Denoiser + ?Sized> Denoiser for &T {
    fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        (**self).forward(x, t)
    }

    fn resampling_factor(&self) -> usize {
        (**self).resampling_factor()
    }
}
