//! Denoising diffusion for 3-D point clouds in pure Rust.
//!
//! A candle-based DDPM that treats an unordered point cloud as a 1-D,
//! three-channel signal `[B, 3, N]`, learns to predict the noise added to
//! it, and samples new clouds with the ancestral reverse process.
//!
//! ## Architecture
//!
//! ```text
//! x_0 [B, 3, N] ──┐
//!                 ├→ forward_sample (closed form, cosine schedule)
//! t ~ U{0..T-1} ──┘
//!                        ↓
//!          PointUNet (1-D U-Net, GroupNorm + SiLU + attention)
//!                        ↓
//!          ε̂ [B, 3, N] ──→ MSE(ε̂, ε)            (training)
//!
//! x_T ~ N(0, I) ──→ T × (PointUNet + posterior step) ──→ x_0   (sampling)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: network, schedule and training configuration
//! - [`schedule`]: cosine noise schedule, coefficient gathering, forward corruption
//! - [`noise`]: seeded Gaussian noise and timestep draws
//! - [`model`]: time embedding, residual/attention/resampling blocks, the U-Net
//! - [`diffusion`]: training loss and the ancestral sampling loop
//! - [`data`]: batch sources and axis helpers at the dataset boundary
//! - [`training`]: epoch loop over a batch source with an external optimizer
//! - [`pipeline`]: parameters + process bundle with checkpoint save/load

pub mod config;
pub mod data;
pub mod diffusion;
pub mod model;
pub mod noise;
pub mod pipeline;
pub mod schedule;
pub mod training;

mod error;

pub use error::{Error, Result};
