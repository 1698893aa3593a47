//! Sample point clouds from a trained checkpoint.
//!
//! Runs the full reverse process for `--num-samples` clouds, `--batch-size`
//! at a time, and writes them as a `points` tensor of shape `[B, N, 3]` into a
//! safetensors file. Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"samples.safetensors","num_samples":16,"num_points":2048,"seed":0}
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;

use clap::Parser;
use point_diffusion_rs::{data::to_points_last, noise, pipeline::PointDiffusionPipeline};

#[derive(Parser, Debug)]
#[command(
    name = "pcd-sample",
    about = "Generate point clouds with a trained diffusion model"
)]
struct Args {
    /// Checkpoint directory written by pcd-train.
    #[arg(long, short = 'c')]
    checkpoint: PathBuf,

    /// Output safetensors file.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Total clouds to generate.
    #[arg(long, short = 'n', default_value_t = 16)]
    num_samples: usize,

    /// Clouds per reverse-process run.
    #[arg(long, short = 'b', default_value_t = 8)]
    batch_size: usize,

    /// Points per cloud; must be a multiple of 2^(levels-1).
    #[arg(long, default_value_t = 2048)]
    num_points: usize,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,
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

    if args.num_samples == 0 || args.batch_size == 0 {
        anyhow::bail!("--num-samples and --batch-size must both be at least 1");
    }
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let pipeline = PointDiffusionPipeline::load(&args.checkpoint, &device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
    let process = pipeline.process();
    let timesteps = process.schedule().timesteps();

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = noise::seeded(seed);
    tracing::info!("Seed: {seed}");

    let mut chunks = Vec::new();
    let mut remaining = args.num_samples;
    while remaining > 0 {
        let batch = remaining.min(args.batch_size);
        let done = args.num_samples - remaining;
        tracing::info!("Sampling clouds {}..{} of {}", done, done + batch, args.num_samples);
        let features = process
            .sample_with_progress(batch, args.num_points, &mut rng, |t| {
                if t % 100 == 0 {
                    tracing::debug!("step {}/{}", timesteps - t, timesteps);
                }
                ControlFlow::Continue(())
            })
            .map_err(|e| anyhow::anyhow!("sampling failed: {e}"))?;
        chunks.push(to_points_last(&features)?.to_device(&candle_core::Device::Cpu)?);
        remaining -= batch;
    }

    let points = candle_core::Tensor::cat(&chunks, 0)?;
    candle_core::safetensors::save(
        &std::collections::HashMap::from([("points".to_string(), points)]),
        &args.output,
    )?;

    println!(
        r#"{{"path":{path},"num_samples":{n},"num_points":{p},"seed":{seed}}}"#,
        path = serde_json::to_string(&args.output.display().to_string())?,
        n = args.num_samples,
        p = args.num_points,
    );

    Ok(())
}
