//! Point-cloud batches at the dataset boundary.
//!
//! The core consumes `[B, 3, N]`; datasets hand out `[B, N, 3]`. A
//! [`BatchSource`] is any restartable sequence of such batches. File formats,
//! resampling to a fixed `N` and normalization belong to whoever implements it.

use candle_core::{D, Device, Tensor};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result, noise};

/// `[B, N, 3]` → `[B, 3, N]` (contiguous).
pub fn to_channels_first(points: &Tensor) -> Result<Tensor> {
    let (_b, _n, c) = points.dims3()?;
    if c != 3 {
        return Err(Error::Shape(format!("expected [B, N, 3] points, got last dim {c}")));
    }
    Ok(points.permute((0, 2, 1))?.contiguous()?)
}

/// `[B, 3, N]` → `[B, N, 3]` (contiguous).
pub fn to_points_last(features: &Tensor) -> Result<Tensor> {
    let (_b, c, _n) = features.dims3()?;
    if c != 3 {
        return Err(Error::Shape(format!("expected [B, 3, N] features, got {c} channels")));
    }
    Ok(features.permute((0, 2, 1))?.contiguous()?)
}

/// A lazy, restartable sequence of `[B, N, 3]` batches.
pub trait BatchSource {
    /// Rewind to the start of a new epoch.
    fn reset(&mut self) -> Result<()>;

    /// Next batch, or `None` at the end of the epoch.
    fn next_batch(&mut self) -> Result<Option<Tensor>>;
}

/// Batches drawn from a `[M, N, 3]` tensor held in memory, reshuffled every epoch.
pub struct InMemoryPointClouds {
    clouds: Tensor,
    batch_size: usize,
    drop_last: bool,
    rng: ChaCha8Rng,
    order: Vec<u32>,
    position: usize,
}

impl InMemoryPointClouds {
    pub fn new(clouds: Tensor, batch_size: usize, drop_last: bool, seed: u64) -> Result<Self> {
        let (count, _n, c) = clouds.dims3()?;
        if c != 3 {
            return Err(Error::Shape(format!("expected [M, N, 3] clouds, got last dim {c}")));
        }
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }
        let mut source = Self {
            clouds,
            batch_size,
            drop_last,
            rng: noise::seeded(seed),
            order: (0..count as u32).collect(),
            position: 0,
        };
        source.reset()?;
        Ok(source)
    }

    /// Number of clouds.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.len() / self.batch_size
        } else {
            self.len().div_ceil(self.batch_size)
        }
    }
}

impl BatchSource for InMemoryPointClouds {
    fn reset(&mut self) -> Result<()> {
        self.position = 0;
        self.order.shuffle(&mut self.rng);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        let end = (self.position + self.batch_size).min(self.order.len());
        let take = end.saturating_sub(self.position);
        if take == 0 || (self.drop_last && take < self.batch_size) {
            return Ok(None);
        }
        let ids = Tensor::new(&self.order[self.position..end], self.clouds.device())?;
        self.position = end;
        Ok(Some(self.clouds.index_select(&ids, 0)?))
    }
}

/// `count` clouds of `num_points` points uniformly spread over the unit sphere: `[count, N, 3]`.
pub fn unit_sphere(
    count: usize,
    num_points: usize,
    rng: &mut ChaCha8Rng,
    device: &Device,
) -> Result<Tensor> {
    let raw = noise::standard_normal(rng, &[count, num_points, 3], device)?;
    let norm = raw.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    Ok(raw.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn axis_helpers_round_trip_layout() {
        let device = Device::Cpu;
        let points = Tensor::arange(0f32, 12.0, &device)
            .unwrap()
            .reshape((1, 4, 3))
            .unwrap();
        let features = to_channels_first(&points).unwrap();
        assert_eq!(features.dims(), &[1, 3, 4]);
        // x coordinates of the four points become channel 0.
        assert_eq!(
            features.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 3.0, 6.0, 9.0]
        );
        let back = to_points_last(&features).unwrap();
        assert_eq!(back.to_vec3::<f32>().unwrap(), points.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn axis_helpers_reject_wrong_channels() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 4, 5), DType::F32, &device).unwrap();
        assert!(to_channels_first(&x).is_err());
        assert!(to_points_last(&x).is_err());
    }

    #[test]
    fn in_memory_source_covers_every_cloud_once() {
        let device = Device::Cpu;
        // Cloud i is filled with the value i, so batches reveal which clouds they hold.
        let clouds: Vec<Tensor> = (0..5)
            .map(|i| Tensor::full(i as f32, (1, 4, 3), &device).unwrap())
            .collect();
        let clouds = Tensor::cat(&clouds, 0).unwrap();
        let mut source = InMemoryPointClouds::new(clouds, 2, false, 0).unwrap();
        assert_eq!(source.num_batches(), 3);

        let mut seen = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            assert_eq!(&batch.dims()[1..], &[4, 3]);
            for cloud in batch.to_vec3::<f32>().unwrap() {
                seen.push(cloud[0][0] as u32);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // Exhausted until reset.
        assert!(source.next_batch().unwrap().is_none());
        source.reset().unwrap();
        assert!(source.next_batch().unwrap().is_some());
    }

    #[test]
    fn drop_last_skips_partial_batch() {
        let device = Device::Cpu;
        let clouds = Tensor::zeros((5, 4, 3), DType::F32, &device).unwrap();
        let mut source = InMemoryPointClouds::new(clouds, 2, true, 0).unwrap();
        assert_eq!(source.num_batches(), 2);
        let mut batches = 0;
        while source.next_batch().unwrap().is_some() {
            batches += 1;
        }
        assert_eq!(batches, 2);
    }

    #[test]
    fn unit_sphere_points_have_unit_norm() {
        let device = Device::Cpu;
        let clouds = unit_sphere(2, 64, &mut noise::seeded(3), &device).unwrap();
        assert_eq!(clouds.dims(), &[2, 64, 3]);
        let norms = clouds
            .sqr()
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .sqrt()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-5), "norms = {norms:?}");
    }
}
