//! DDPM training objective and ancestral sampler.
//!
//! ## Training
//!
//! ```text
//! t ~ U{0, …, T-1}   ε ~ N(0, I)
//! x_t  = √Ā_t · x_0 + √(1-Ā_t) · ε
//! loss = MSE(ε̂(x_t, t), ε)
//! ```
//!
//! ## Sampling
//!
//! ```text
//! x_T ~ N(0, I)
//! for t = T-1 … 0:
//!     ε̂       = denoiser(x_t, t)
//!     mean    = (1/√α_t) · (x_t − (1−α_t)/√(1−Ā_t) · ε̂)
//!     x_{t-1} = mean + √σ²_t · z,   z ~ N(0, I) for t > 0, z = 0 at t = 0
//! ```
//!
//! The loop is strictly sequential in `t`; only the batch and point axes are
//! parallel within a step.

use std::ops::ControlFlow;
use std::time::Instant;

use candle_core::{Device, Tensor};
use rand_chacha::ChaCha8Rng;

use crate::model::Denoiser;
use crate::noise;
use crate::schedule::NoiseSchedule;
use crate::{Error, Result};

/// Noise schedule + denoiser bundled into the two DDPM operations.
#[derive(Debug, Clone)]
pub struct DiffusionProcess<M> {
    schedule: NoiseSchedule,
    denoiser: M,
    device: Device,
}

impl<M: Denoiser> DiffusionProcess<M> {
    pub fn new(schedule: NoiseSchedule, denoiser: M, device: Device) -> Self {
        Self {
            schedule,
            denoiser,
            device,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn denoiser(&self) -> &M {
        &self.denoiser
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Noise-prediction MSE for a batch `x0` of shape `[B, 3, N]`.
    ///
    /// Returns a scalar tensor that stays attached to the parameter graph.
    pub fn training_loss(&self, x0: &Tensor, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let (batch, _channels, _points) = x0.dims3()?;
        let timesteps = noise::uniform_timesteps(rng, batch, self.schedule.timesteps())?;
        let eps = noise::standard_normal(rng, x0.dims(), x0.device())?.to_dtype(x0.dtype())?;
        let xt = self
            .schedule
            .forward_sample(x0, &timesteps, Some(&eps), rng)?;
        let t = noise::timestep_tensor(&timesteps, x0.device())?;
        let predicted = self.denoiser.forward(&xt, &t)?;
        Ok(candle_nn::loss::mse(&predicted, &eps)?)
    }

    /// Draw `batch` clouds of `num_points` points: `[B, 3, N]`.
    pub fn sample(&self, batch: usize, num_points: usize, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        self.sample_with_progress(batch, num_points, rng, |_| ControlFlow::Continue(()))
    }

    /// [`Self::sample`], calling `on_step(t)` after each reverse step.
    ///
    /// Returning `ControlFlow::Break` from the callback stops the loop; the
    /// partial state is dropped and [`Error::Interrupted`] is returned.
    pub fn sample_with_progress<F>(
        &self,
        batch: usize,
        num_points: usize,
        rng: &mut ChaCha8Rng,
        mut on_step: F,
    ) -> Result<Tensor>
    where
        F: FnMut(usize) -> ControlFlow<()>,
    {
        self.check_sample_shape(batch, num_points)?;
        let dims = [batch, crate::model::unet::POINT_CHANNELS, num_points];
        let total = self.schedule.timesteps();
        let start = Instant::now();
        tracing::info!(batch, num_points, timesteps = total, "sampling");

        let mut xt = noise::standard_normal(rng, &dims, &self.device)?;
        for t in (0..total).rev() {
            xt = self.reverse_step(&xt, t, rng)?;
            if on_step(t).is_break() {
                tracing::info!(timestep = t, "sampling interrupted");
                return Err(Error::Interrupted { timestep: t });
            }
        }

        tracing::info!("sampling done in {:.2}s", start.elapsed().as_secs_f64());
        Ok(xt)
    }

    /// One ancestral step `x_t → x_{t-1}`.
    ///
    /// The result is detached from the parameter graph; sampling never
    /// contributes gradients.
    pub fn reverse_step(&self, xt: &Tensor, t: usize, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let (batch, _channels, _points) = xt.dims3()?;
        let dims = xt.dims();
        let dtype = xt.dtype();
        let device = xt.device();
        let timesteps = vec![t; batch];
        let s = &self.schedule;

        let t_tensor = noise::timestep_tensor(&timesteps, device)?;
        let predicted = self.denoiser.forward(xt, &t_tensor)?.detach();

        let alpha = s.extract(s.alphas(), &timesteps, dims, device)?.to_dtype(dtype)?;
        let alpha_cumprod = s
            .extract(s.alphas_cumprod(), &timesteps, dims, device)?
            .to_dtype(dtype)?;
        let variance = s
            .extract(s.posterior_variance(), &timesteps, dims, device)?
            .to_dtype(dtype)?;

        // mean = (1/√α) · (x_t − (1−α)/√(1−Ā) · ε̂)
        let inv_sqrt_alpha = alpha.sqrt()?.recip()?;
        let noise_coeff = alpha
            .affine(-1.0, 1.0)?
            .broadcast_div(&alpha_cumprod.affine(-1.0, 1.0)?.sqrt()?)?;
        let mean = (xt.detach() - predicted.broadcast_mul(&noise_coeff)?)?
            .broadcast_mul(&inv_sqrt_alpha)?;

        if t == 0 {
            return Ok(mean);
        }
        let z = noise::standard_normal(rng, dims, device)?.to_dtype(dtype)?;
        Ok((mean + z.broadcast_mul(&variance.sqrt()?)?)?)
    }

    fn check_sample_shape(&self, batch: usize, num_points: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::Config("sample batch size must be >= 1".into()));
        }
        let factor = self.denoiser.resampling_factor().max(1);
        if num_points == 0 || num_points % factor != 0 {
            return Err(Error::Config(format!(
                "num_points must be a positive multiple of {factor}, got {num_points}"
            )));
        }
        Ok(())
    }
}
