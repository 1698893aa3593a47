use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use point_diffusion_rs::{
    config::{DiffusionConfig, TrainConfig},
    data::{InMemoryPointClouds, to_channels_first, unit_sphere},
    diffusion::DiffusionProcess,
    model::{Denoiser, unet::PointUNet},
    noise,
    pipeline::PointDiffusionPipeline,
    schedule::NoiseSchedule,
    training::{Trainer, adamw},
};

/// Full 1000-step schedule and four resolution levels, narrow enough for CPU.
fn narrow_config() -> DiffusionConfig {
    DiffusionConfig {
        base_channels: 8,
        time_embedding_dim: 16,
        attention_heads: 2,
        group_norm_groups: 4,
        ..Default::default()
    }
}

fn build(config: &DiffusionConfig, device: &Device) -> (VarMap, DiffusionProcess<PointUNet>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = PointUNet::new(config, vb).unwrap();
    let schedule = NoiseSchedule::new(config.timesteps, config.schedule_shift).unwrap();
    (varmap, DiffusionProcess::new(schedule, net, device.clone()))
}

fn all_finite(t: &Tensor) -> bool {
    t.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

#[test]
fn sphere_loss_then_full_reverse_process() {
    let device = Device::Cpu;
    let config = narrow_config();
    assert_eq!(config.timesteps, 1000);
    assert_eq!(config.num_levels(), 4);
    let (_varmap, process) = build(&config, &device);

    let mut rng = noise::seeded(2024);
    let sphere = unit_sphere(1, 128, &mut rng, &device).unwrap();
    let x0 = to_channels_first(&sphere).unwrap();
    let loss: f32 = process
        .training_loss(&x0, &mut rng)
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(loss.is_finite() && loss >= 0.0, "loss = {loss}");

    let sample = process.sample(1, 128, &mut rng).unwrap();
    assert_eq!(sample.dims(), &[1, 3, 128]);
    assert!(all_finite(&sample), "sample contains non-finite values");
}

#[test]
fn network_preserves_non_power_of_two_length() {
    let device = Device::Cpu;
    let config = narrow_config();
    let (_varmap, process) = build(&config, &device);

    // 100 → 50 → 25 → 13 on the way down; upsampled features are resized to each skip.
    let x = Tensor::randn(0f32, 1.0, (2, 3, 100), &device).unwrap();
    let t = Tensor::new(&[0u32, 999], &device).unwrap();
    let out = process.denoiser().forward(&x, &t).unwrap();
    assert_eq!(out.dims(), &[2, 3, 100]);
    assert!(all_finite(&out));

    // The sampler itself only accepts exactly reversible point counts.
    assert!(process.sample(1, 100, &mut noise::seeded(0)).is_err());
}

#[test]
fn short_training_run_then_checkpoint_and_sample() {
    let device = Device::Cpu;
    let config = DiffusionConfig {
        timesteps: 50,
        channel_multipliers: vec![1, 2],
        ..narrow_config()
    };
    let pipeline = PointDiffusionPipeline::new(config, &device).unwrap();

    let train_config = TrainConfig {
        epochs: 2,
        batch_size: 4,
        learning_rate: 1e-3,
        ..Default::default()
    };
    let mut rng = noise::seeded(train_config.seed);
    let clouds = unit_sphere(8, 32, &mut rng, &device).unwrap();
    let mut source =
        InMemoryPointClouds::new(clouds, train_config.batch_size, true, train_config.seed).unwrap();
    let optimizer = adamw(pipeline.varmap(), &train_config).unwrap();
    let mut trainer = Trainer::new(optimizer, train_config.epochs);
    let history = trainer
        .fit(pipeline.process(), &mut source, &mut rng)
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|l| l.is_finite()), "{history:?}");

    let dir = tempfile::tempdir().unwrap();
    pipeline.save(dir.path()).unwrap();
    let restored = PointDiffusionPipeline::load(dir.path(), &device).unwrap();

    let points = restored.generate(3, 32, 7).unwrap();
    assert_eq!(points.dims(), &[3, 32, 3]);
    assert!(all_finite(&points));
    let spread: f32 = points
        .sqr()
        .unwrap()
        .sum(D::Minus1)
        .unwrap()
        .mean_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(spread.is_finite());
}
