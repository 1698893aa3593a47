//! Seeded randomness for the diffusion process.
//!
//! Every draw goes through an explicit [`ChaCha8Rng`] handle owned by the
//! caller, so two sampling runs never share generator state and a fixed seed
//! reproduces the same noise on any device.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::{Error, Result};

/// Create a generator from a seed.
pub fn seeded(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Standard-normal `f32` tensor of `dims`, drawn on the host then moved to `device`.
pub fn standard_normal(rng: &mut ChaCha8Rng, dims: &[usize], device: &Device) -> Result<Tensor> {
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, dims.to_vec(), device)?)
}

/// Independent uniform timesteps in `[0, timesteps)`, one per batch element.
pub fn uniform_timesteps(
    rng: &mut ChaCha8Rng,
    batch: usize,
    timesteps: usize,
) -> Result<Vec<usize>> {
    if timesteps == 0 {
        return Err(Error::Config("cannot draw from an empty schedule".into()));
    }
    Ok((0..batch).map(|_| rng.random_range(0..timesteps)).collect())
}

/// Timesteps as the `[B]` `u32` tensor the denoiser consumes.
pub fn timestep_tensor(timesteps: &[usize], device: &Device) -> Result<Tensor> {
    let values: Vec<u32> = timesteps.iter().map(|&t| t as u32).collect();
    Ok(Tensor::from_vec(values, timesteps.len(), device)?)
}
