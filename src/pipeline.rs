//! Parameters + diffusion process, with checkpoint save/load.
//!
//! A checkpoint is a directory:
//!
//! ```text
//! <dir>/config.json         DiffusionConfig
//! <dir>/model.safetensors   every PointUNet parameter
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::DiffusionConfig;
use crate::data::to_points_last;
use crate::diffusion::DiffusionProcess;
use crate::model::unet::PointUNet;
use crate::schedule::NoiseSchedule;
use crate::{Result, noise};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// A trainable point-cloud DDPM: the variable store, its config and the
/// process built on top of it.
pub struct PointDiffusionPipeline {
    varmap: VarMap,
    config: DiffusionConfig,
    process: DiffusionProcess<PointUNet>,
}

impl PointDiffusionPipeline {
    /// Fresh, randomly initialized network for `config`.
    pub fn new(config: DiffusionConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = PointUNet::new(&config, vb)?;
        let schedule = NoiseSchedule::new(config.timesteps, config.schedule_shift)?;
        let process = DiffusionProcess::new(schedule, net, device.clone());
        tracing::info!(
            levels = config.num_levels(),
            base_channels = config.base_channels,
            timesteps = config.timesteps,
            parameters = parameter_count(&varmap),
            "built point diffusion model"
        );
        Ok(Self {
            varmap,
            config,
            process,
        })
    }

    /// Rebuild the network from `<dir>/config.json` and overwrite its
    /// parameters with `<dir>/model.safetensors`.
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let raw = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
        let config: DiffusionConfig = serde_json::from_str(&raw)?;
        let mut pipeline = Self::new(config, device)?;
        pipeline.varmap.load(dir.join(WEIGHTS_FILE))?;
        tracing::info!("loaded checkpoint from {}", dir.display());
        Ok(pipeline)
    }

    /// Write `config.json` and `model.safetensors` into `dir`, creating it if needed.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        tracing::info!("saved checkpoint to {}", dir.display());
        Ok(())
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn process(&self) -> &DiffusionProcess<PointUNet> {
        &self.process
    }

    pub fn device(&self) -> &Device {
        self.process.device()
    }

    /// Sample `batch` clouds of `num_points` points as `[B, N, 3]`.
    pub fn generate(&self, batch: usize, num_points: usize, seed: u64) -> Result<Tensor> {
        let mut rng = noise::seeded(seed);
        let features = self.process.sample(batch, num_points, &mut rng)?;
        to_points_last(&features)
    }
}

fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
