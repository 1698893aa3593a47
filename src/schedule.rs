//! Cosine noise schedule for DDPM.
//!
//! All coefficients are computed once, in `f64`, from the timestep count `T`
//! and the offset `s` ("Improved DDPM" cosine schedule):
//!
//! ```text
//! f(i)  = cos(((i/T + s) / (1 + s)) · π/2)²        i in [0, T]
//! ᾱ(i)  = f(i) / f(0)
//! β_t   = clip(1 - ᾱ(t+1)/ᾱ(t), 1e-4, 0.9999)      t in [0, T)
//! ```
//!
//! and then `α_t = 1 - β_t`, `Ā_t = ∏_{k≤t} α_k`, `Ā_{t-1}` (with `Ā_{-1} = 1`),
//! `√(1/α_t)`, `√Ā_t`, `√(1-Ā_t)` and the posterior variance
//! `β_t · (1 - Ā_{t-1}) / (1 - Ā_t)`.
//!
//! The clip is what keeps `1/√α_t` and `1/√(1-Ā_t)` bounded: `α_t ≥ 1e-4`
//! and `1 - Ā_t ≥ β_0 ≥ 1e-4`.

use candle_core::Tensor;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Lower clip bound for betas.
pub const BETA_MIN: f64 = 1e-4;
/// Upper clip bound for betas.
pub const BETA_MAX: f64 = 0.9999;

/// Immutable table of per-timestep diffusion coefficients.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    timesteps: usize,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_recip_alphas: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
}

/// Cosine betas, clipped to `[BETA_MIN, BETA_MAX]`.
pub fn cosine_betas(timesteps: usize, s: f64) -> Vec<f64> {
    let t = timesteps as f64;
    let f = |i: usize| {
        let x = ((i as f64 / t) + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2;
        x.cos().powi(2)
    };
    let f0 = f(0);
    let alphas_bar: Vec<f64> = (0..=timesteps).map(|i| f(i) / f0).collect();
    alphas_bar
        .windows(2)
        .map(|w| (1.0 - w[1] / w[0]).clamp(BETA_MIN, BETA_MAX))
        .collect()
}

impl NoiseSchedule {
    /// Build the schedule for `timesteps` steps with cosine offset `s`.
    pub fn new(timesteps: usize, s: f64) -> Result<Self> {
        if timesteps == 0 {
            return Err(Error::Config("timesteps must be > 0".into()));
        }
        let betas = cosine_betas(timesteps, s);
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(timesteps);
        let mut acc = 1.0;
        for a in &alphas {
            acc *= a;
            alphas_cumprod.push(acc);
        }

        // Shift right by one, Ā_{-1} = 1.
        let mut alphas_cumprod_prev = Vec::with_capacity(timesteps);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..timesteps - 1]);

        let sqrt_recip_alphas = alphas.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let posterior_variance = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
            .map(|(b, (ac, prev))| b * (1.0 - prev) / (1.0 - ac))
            .collect();

        Ok(Self {
            timesteps,
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_recip_alphas,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            posterior_variance,
        })
    }

    /// Number of timesteps `T`.
    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn sqrt_recip_alphas(&self) -> &[f64] {
        &self.sqrt_recip_alphas
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    /// Gather one coefficient per batch element from `sequence`.
    ///
    /// Returns an `f32` tensor of shape `[B, 1, ..., 1]` with the same rank as
    /// `target_dims`, ready to broadcast against a `[B, ...]` tensor.
    pub fn extract(
        &self,
        sequence: &[f64],
        timesteps: &[usize],
        target_dims: &[usize],
        device: &candle_core::Device,
    ) -> Result<Tensor> {
        let Some(&batch) = target_dims.first() else {
            return Err(Error::Shape("extract target shape must have rank >= 1".into()));
        };
        if timesteps.len() != batch {
            return Err(Error::Shape(format!(
                "got {} timesteps for a batch of {batch}",
                timesteps.len()
            )));
        }
        let values = timesteps
            .iter()
            .map(|&t| {
                sequence
                    .get(t)
                    .filter(|_| t < self.timesteps)
                    .map(|&v| v as f32)
                    .ok_or(Error::TimestepOutOfRange {
                        timestep: t,
                        timesteps: self.timesteps,
                    })
            })
            .collect::<Result<Vec<f32>>>()?;

        let mut dims = vec![1usize; target_dims.len()];
        dims[0] = batch;
        Ok(Tensor::from_vec(values, dims, device)?)
    }

    /// Closed-form forward corruption `q(x_t | x_0)`:
    /// `√Ā_t · x_0 + √(1-Ā_t) · ε`.
    ///
    /// When `noise` is `None`, `ε` is drawn from `rng`.
    pub fn forward_sample(
        &self,
        x0: &Tensor,
        timesteps: &[usize],
        noise: Option<&Tensor>,
        rng: &mut ChaCha8Rng,
    ) -> Result<Tensor> {
        let dims = x0.dims();
        let noise = match noise {
            Some(n) if n.dims() != dims => {
                return Err(Error::Shape(format!(
                    "noise shape {:?} does not match x0 shape {dims:?}",
                    n.dims()
                )));
            }
            Some(n) => n.clone(),
            None => crate::noise::standard_normal(rng, dims, x0.device())?,
        };
        let dtype = x0.dtype();
        let signal = self
            .extract(&self.sqrt_alphas_cumprod, timesteps, dims, x0.device())?
            .to_dtype(dtype)?;
        let residual = self
            .extract(&self.sqrt_one_minus_alphas_cumprod, timesteps, dims, x0.device())?
            .to_dtype(dtype)?;
        Ok((x0.broadcast_mul(&signal)? + noise.to_dtype(dtype)?.broadcast_mul(&residual)?)?)
    }
}
