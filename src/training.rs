//! Epoch loop: batch source → loss → optimizer step.
//!
//! The optimizer is owned by the caller (any [`candle_nn::Optimizer`]); the
//! trainer only sequences `reset → next_batch → training_loss → backward_step`
//! and reports the mean loss of every epoch.

use std::time::Instant;

use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand_chacha::ChaCha8Rng;

use crate::config::TrainConfig;
use crate::data::{BatchSource, to_channels_first};
use crate::diffusion::DiffusionProcess;
use crate::model::Denoiser;
use crate::{Error, Result};

/// AdamW over every variable in `varmap`, configured from `config`.
pub fn adamw(varmap: &VarMap, config: &TrainConfig) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..Default::default()
    };
    Ok(AdamW::new(varmap.all_vars(), params)?)
}

/// Drives an externally-owned optimizer over a [`BatchSource`].
pub struct Trainer<O> {
    optimizer: O,
    epochs: usize,
}

impl<O: Optimizer> Trainer<O> {
    pub fn new(optimizer: O, epochs: usize) -> Self {
        Self { optimizer, epochs }
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// One pass over `source`; returns the mean batch loss.
    pub fn train_epoch<M, S>(
        &mut self,
        process: &DiffusionProcess<M>,
        source: &mut S,
        rng: &mut ChaCha8Rng,
    ) -> Result<f64>
    where
        M: Denoiser,
        S: BatchSource + ?Sized,
    {
        source.reset()?;
        let mut total = 0.0;
        let mut batches = 0usize;
        while let Some(batch) = source.next_batch()? {
            // [B, N, 3] → [B, 3, N]
            let x0 = to_channels_first(&batch)?.to_device(process.device())?;
            let loss = process.training_loss(&x0, rng)?;
            self.optimizer.backward_step(&loss)?;
            let value = loss.to_scalar::<f32>()? as f64;
            tracing::debug!(batch = batches, loss = value, "step");
            total += value;
            batches += 1;
        }
        if batches == 0 {
            return Err(Error::Config("batch source produced no batches".into()));
        }
        Ok(total / batches as f64)
    }

    /// Run every epoch; returns the mean loss of each.
    pub fn fit<M, S>(
        &mut self,
        process: &DiffusionProcess<M>,
        source: &mut S,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<f64>>
    where
        M: Denoiser,
        S: BatchSource + ?Sized,
    {
        let mut history = Vec::with_capacity(self.epochs);
        for epoch in 0..self.epochs {
            let start = Instant::now();
            let mean = self.train_epoch(process, source, rng)?;
            tracing::info!(
                "Epoch {}/{}, Loss: {:.4} ({:.1}s)",
                epoch + 1,
                self.epochs,
                mean,
                start.elapsed().as_secs_f64()
            );
            history.push(mean);
        }
        Ok(history)
    }
}
