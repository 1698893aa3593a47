//! Train a point-cloud diffusion model.
//!
//! Trains on either a saved set of clouds (a safetensors file holding a
//! `points` tensor of shape `[M, N, 3]`) or, without `--data`, on synthetic
//! unit-sphere clouds. Writes a checkpoint directory with `config.json` and
//! `model.safetensors`, then prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"checkpoint":"runs/sphere","epochs":5,"final_loss":0.0412}
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use point_diffusion_rs::{
    config::{DiffusionConfig, TrainConfig},
    data::{InMemoryPointClouds, unit_sphere},
    noise,
    pipeline::PointDiffusionPipeline,
    training::{Trainer, adamw},
};

#[derive(Parser, Debug)]
#[command(
    name = "pcd-train",
    about = "Train a DDPM on 3-D point clouds",
    long_about = "Train a point-cloud diffusion model and write a checkpoint directory.\n\
                  Without --data, trains on synthetic unit-sphere clouds."
)]
struct Args {
    /// Checkpoint directory to write.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Safetensors file with a `points` tensor of shape [M, N, 3].
    #[arg(long)]
    data: Option<PathBuf>,

    /// JSON model config; unspecified fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Synthetic clouds to generate when --data is not given.
    #[arg(long, default_value_t = 256)]
    synthetic_clouds: usize,

    /// Points per synthetic cloud.
    #[arg(long, default_value_t = 1024)]
    num_points: usize,

    #[arg(long, default_value_t = 5)]
    epochs: usize,

    #[arg(long, short = 'b', default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,

    /// Drop the final partial batch of every epoch.
    #[arg(long)]
    drop_last: bool,

    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let model_config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<DiffusionConfig>(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => DiffusionConfig::default(),
    };
    let train_config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        seed: args.seed,
    };

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let mut rng = noise::seeded(train_config.seed);
    let clouds = match &args.data {
        Some(path) => {
            let mut tensors = candle_core::safetensors::load(path, &candle_core::Device::Cpu)
                .with_context(|| format!("failed to read {}", path.display()))?;
            tensors
                .remove("points")
                .with_context(|| format!("{} has no `points` tensor", path.display()))?
                .to_dtype(candle_core::DType::F32)?
        }
        None => {
            tracing::info!(
                "Generating {} unit-sphere clouds of {} points",
                args.synthetic_clouds,
                args.num_points
            );
            unit_sphere(
                args.synthetic_clouds,
                args.num_points,
                &mut rng,
                &candle_core::Device::Cpu,
            )?
        }
    };
    let mut source = InMemoryPointClouds::new(
        clouds,
        train_config.batch_size,
        args.drop_last,
        train_config.seed,
    )?;
    tracing::info!(
        "{} clouds, {} batches per epoch",
        source.len(),
        source.num_batches()
    );

    let pipeline = PointDiffusionPipeline::new(model_config, &device)
        .map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;
    let optimizer = adamw(pipeline.varmap(), &train_config)?;
    let mut trainer = Trainer::new(optimizer, train_config.epochs);
    let history = trainer
        .fit(pipeline.process(), &mut source, &mut rng)
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;

    pipeline
        .save(&args.output)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;

    let final_loss = history.last().copied().unwrap_or(f64::NAN);
    println!(
        r#"{{"checkpoint":{path},"epochs":{epochs},"final_loss":{loss:.6}}}"#,
        path = serde_json::to_string(&args.output.display().to_string())?,
        epochs = history.len(),
        loss = final_loss,
    );

    Ok(())
}
