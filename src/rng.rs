//! Seedable randomness for the diffusion core.
//!
//! Every stochastic draw (noise, timesteps, null-condition masks, sampler
//! noise) goes through [`NoiseSource`]. Values are generated on the host and
//! uploaded with [`TensorData`], so a seed fixes the result regardless of the
//! backend's own RNG state.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::guidance::NullConditionMask;

/// Explicit, seedable random source.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    rng: StdRng,
    seed: u64,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed this source was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Standard normal tensor of the given shape.
    pub fn normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let count = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..count)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Standard normal tensor shaped like `like`.
    pub fn normal_like<B: Backend, const D: usize>(&mut self, like: &Tensor<B, D>) -> Tensor<B, D> {
        self.normal(like.dims(), &like.device())
    }

    /// One timestep per example, uniform over `0..timesteps`.
    pub fn timesteps(&mut self, batch_size: usize, timesteps: usize) -> Vec<usize> {
        (0..batch_size)
            .map(|_| self.rng.gen_range(0..timesteps))
            .collect()
    }

    /// Bernoulli draw per example with probability `prob` of null conditioning.
    pub fn null_condition_mask(&mut self, batch_size: usize, prob: f64) -> NullConditionMask {
        let prob = prob.clamp(0.0, 1.0);
        NullConditionMask::from_vec(
            (0..batch_size).map(|_| self.rng.gen_bool(prob)).collect(),
        )
    }

    /// Derive an independent source, e.g. for a sampling run inside training.
    pub fn fork(&mut self) -> Self {
        Self::new(self.rng.gen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_noise() {
        let device = Default::default();
        let a = NoiseSource::new(7).normal::<TestBackend, 3>([2, 3, 4], &device);
        let b = NoiseSource::new(7).normal::<TestBackend, 3>([2, 3, 4], &device);
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_timesteps_in_range() {
        let mut source = NoiseSource::new(3);
        let t = source.timesteps(64, 10);
        assert_eq!(t.len(), 64);
        assert!(t.iter().all(|&t| t < 10));
    }

    #[test]
    fn test_mask_extremes() {
        let mut source = NoiseSource::new(0);
        assert!(source.null_condition_mask(5, 0.0).iter().all(|m| !m));
        assert!(source.null_condition_mask(5, 1.0).iter().all(|m| m));
    }
}
