//! Gaussian diffusion over flow stacks
//!
//! Training draws a timestep, noise and a null-conditioning mask per example
//! and regresses the denoiser onto the configured target. Sampling runs the
//! reverse process from pure noise, either ancestrally over every timestep
//! or with DDIM over a subsequence, with classifier-free guidance.

use burn::module::{Ignored, Module};
use burn::prelude::*;
use burn::tensor::ElementConversion;

use crate::config::{DenoiserConfig, DiffusionConfig, LossType, Objective};
use crate::error::{FlowDiffusionError, Result};
use crate::guidance::{
    classifier_free_guidance, dynamic_threshold, static_threshold, NullConditionMask,
};
use crate::modules::{Conditioning, Denoise, FlowDenoiser};
use crate::rng::NoiseSource;
use crate::schedule::{NoiseSchedule, SamplingMode, SamplingStep};

/// Result of one training-mode call.
#[derive(Debug, Clone)]
pub struct DiffusionLoss<B: Backend> {
    /// Scalar loss [1]
    pub loss: Tensor<B, 1>,
    /// Which examples were null-conditioned, one entry per example
    pub null_mask: NullConditionMask,
    /// Timestep drawn for each example
    pub timesteps: Vec<usize>,
}

impl<B: Backend> DiffusionLoss<B> {
    /// Loss as a host scalar.
    pub fn value(&self) -> f32 {
        self.loss.clone().into_scalar().elem::<f32>()
    }
}

/// Schedule plus process settings, independent of the network.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    config: DiffusionConfig,
}

impl GaussianDiffusion {
    pub fn new(config: DiffusionConfig) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::new(config.beta_schedule, config.timesteps)?;
        Ok(Self { schedule, config })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    /// Training loss for a clean target [batch, channels, frames, height, width].
    pub fn loss<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        target: Tensor<B, 5>,
        cond: &Conditioning<B>,
        noise: &mut NoiseSource,
    ) -> Result<DiffusionLoss<B>> {
        let [batch, channels, _, _, _] = target.dims();
        FlowDiffusionError::expect_dim("target channels", self.config.channels, channels)?;
        FlowDiffusionError::expect_dim("conditioning batch", batch, cond.batch_size())?;

        let timesteps = noise.timesteps(batch, self.schedule.num_timesteps());
        let null_mask = noise.null_condition_mask(batch, self.config.null_cond_prob);
        let eps = noise.normal_like(&target);

        let x_t = self.schedule.q_sample(target.clone(), &timesteps, eps.clone());
        let pred = denoiser.predict(x_t, &timesteps, cond, &null_mask)?;

        let expected = match self.config.objective {
            Objective::PredictNoise => eps,
            Objective::PredictStart => target,
        };
        let diff = pred - expected;
        let loss = match self.config.loss_type {
            LossType::L1 => diff.abs().mean(),
            LossType::L2 => diff.powf_scalar(2.0).mean(),
        };

        Ok(DiffusionLoss {
            loss,
            null_mask,
            timesteps,
        })
    }

    /// Generate `batch_size` samples [batch, channels, frames, size, size].
    ///
    /// Runs exactly `sampling_timesteps` reverse steps; each step evaluates
    /// the denoiser once, twice when `cond_scale != 1`.
    pub fn sample<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        cond: &Conditioning<B>,
        batch_size: usize,
        cond_scale: f32,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 5>> {
        let [f_batch, _, f_height, f_width] = cond.feature.dims();
        FlowDiffusionError::expect_dim("conditioning batch", batch_size, f_batch)?;
        FlowDiffusionError::expect_dim("text batch", batch_size, cond.text.dims()[0])?;
        FlowDiffusionError::expect_dim("feature height", self.config.image_size, f_height)?;
        FlowDiffusionError::expect_dim("feature width", self.config.image_size, f_width)?;

        let plan = self
            .schedule
            .sampling_plan(self.config.sampling_timesteps, self.config.ddim_sampling_eta)?;
        let device = cond.feature.device();
        let shape = [
            batch_size,
            self.config.channels,
            self.config.num_frames,
            self.config.image_size,
            self.config.image_size,
        ];

        tracing::debug!(
            steps = plan.len(),
            mode = ?plan.mode,
            cond_scale,
            batch_size,
            "sampling flow"
        );

        let mut img = noise.normal::<B, 5>(shape, &device);
        for step in &plan.steps {
            img = match plan.mode {
                SamplingMode::Ancestral => {
                    self.ancestral_step(denoiser, img, *step, cond, cond_scale, noise)?
                }
                SamplingMode::Ddim { eta } => {
                    self.ddim_step(denoiser, img, *step, eta, cond, cond_scale, noise)?
                }
            };

            let total: f32 = img.clone().sum().into_scalar().elem();
            if !total.is_finite() {
                return Err(FlowDiffusionError::NumericalInstability {
                    timestep: step.timestep,
                });
            }
        }

        Ok(img)
    }

    fn ancestral_step<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        img: Tensor<B, 5>,
        step: SamplingStep,
        cond: &Conditioning<B>,
        cond_scale: f32,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 5>> {
        let timesteps = vec![step.timestep; img.dims()[0]];
        let (_, x_start) = self.model_predictions(denoiser, img.clone(), &timesteps, cond, cond_scale)?;
        let (mean, log_var) = self.schedule.q_posterior(x_start, img, &timesteps);

        if step.timestep == 0 {
            return Ok(mean);
        }
        let z = noise.normal_like(&mean);
        Ok(mean + (log_var * 0.5).exp() * z)
    }

    #[allow(clippy::too_many_arguments)]
    fn ddim_step<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        img: Tensor<B, 5>,
        step: SamplingStep,
        eta: f64,
        cond: &Conditioning<B>,
        cond_scale: f32,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 5>> {
        let timesteps = vec![step.timestep; img.dims()[0]];
        let (pred_noise, x_start) =
            self.model_predictions(denoiser, img, &timesteps, cond, cond_scale)?;

        let Some(next) = step.next else {
            return Ok(x_start);
        };

        let alpha = self.schedule.alphas_cumprod[step.timestep];
        let alpha_next = self.schedule.alphas_cumprod[next];
        let sigma = eta * ((1.0 - alpha / alpha_next) * (1.0 - alpha_next) / (1.0 - alpha)).sqrt();
        let c = (1.0 - alpha_next - sigma * sigma).max(0.0).sqrt();

        let mut out = x_start * alpha_next.sqrt() as f32 + pred_noise * c as f32;
        if sigma > 0.0 {
            out = out.clone() + noise.normal_like(&out) * sigma as f32;
        }
        Ok(out)
    }

    /// Guided prediction turned into (ε, thresholded x_0).
    fn model_predictions<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        img: Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        cond_scale: f32,
    ) -> Result<(Tensor<B, 5>, Tensor<B, 5>)> {
        let out = self.guided_predict(denoiser, img.clone(), timesteps, cond, cond_scale)?;

        Ok(match self.config.objective {
            Objective::PredictNoise => {
                let x_start = self
                    .schedule
                    .predict_start_from_noise(img, timesteps, out.clone());
                (out, self.threshold(x_start))
            }
            Objective::PredictStart => {
                let x_start = self.threshold(out);
                let pred_noise =
                    self.schedule
                        .predict_noise_from_start(img, timesteps, x_start.clone());
                (pred_noise, x_start)
            }
        })
    }

    fn guided_predict<B: Backend, D: Denoise<B>>(
        &self,
        denoiser: &D,
        img: Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        cond_scale: f32,
    ) -> Result<Tensor<B, 5>> {
        let batch = timesteps.len();
        let cond_pred =
            denoiser.predict(img.clone(), timesteps, cond, &NullConditionMask::none(batch))?;
        if cond_scale == 1.0 {
            return Ok(cond_pred);
        }
        let null_pred = denoiser.predict(img, timesteps, cond, &NullConditionMask::all(batch))?;
        Ok(classifier_free_guidance(cond_pred, null_pred, cond_scale))
    }

    fn threshold<B: Backend>(&self, x_start: Tensor<B, 5>) -> Tensor<B, 5> {
        if self.config.use_dynamic_thres {
            dynamic_threshold(x_start, self.config.dynamic_thres_percentile)
        } else {
            static_threshold(x_start)
        }
    }
}

/// Trainable denoiser bundled with its diffusion process.
///
/// Only the denoiser carries parameters; the schedule is a fixed table.
#[derive(Module, Debug)]
pub struct FlowDiffusion<B: Backend> {
    denoiser: FlowDenoiser<B>,
    process: Ignored<GaussianDiffusion>,
}

impl<B: Backend> FlowDiffusion<B> {
    pub fn new(
        diffusion: DiffusionConfig,
        denoiser: &DenoiserConfig,
        device: &B::Device,
    ) -> Result<Self> {
        diffusion.validate_with(denoiser)?;
        Ok(Self {
            denoiser: denoiser.init(device)?,
            process: Ignored(GaussianDiffusion::new(diffusion)?),
        })
    }

    pub fn denoiser(&self) -> &FlowDenoiser<B> {
        &self.denoiser
    }

    pub fn process(&self) -> &GaussianDiffusion {
        &self.process.0
    }

    pub fn config(&self) -> &DiffusionConfig {
        self.process.0.config()
    }

    pub fn loss(
        &self,
        target: Tensor<B, 5>,
        cond: &Conditioning<B>,
        noise: &mut NoiseSource,
    ) -> Result<DiffusionLoss<B>> {
        self.process.0.loss(&self.denoiser, target, cond, noise)
    }

    pub fn sample(
        &self,
        cond: &Conditioning<B>,
        batch_size: usize,
        cond_scale: f32,
        noise: &mut NoiseSource,
    ) -> Result<Tensor<B, 5>> {
        self.process
            .0
            .sample(&self.denoiser, cond, batch_size, cond_scale, noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    /// Predicts zeros and counts conditional and null calls.
    struct ZeroDenoiser {
        cond_calls: Cell<usize>,
        null_calls: Cell<usize>,
    }

    impl ZeroDenoiser {
        fn new() -> Self {
            Self {
                cond_calls: Cell::new(0),
                null_calls: Cell::new(0),
            }
        }
    }

    impl Denoise<TestBackend> for ZeroDenoiser {
        fn predict(
            &self,
            x: Tensor<TestBackend, 5>,
            _timesteps: &[usize],
            _cond: &Conditioning<TestBackend>,
            null_mask: &NullConditionMask,
        ) -> Result<Tensor<TestBackend, 5>> {
            if null_mask.count_null() > 0 {
                self.null_calls.set(self.null_calls.get() + 1);
            } else {
                self.cond_calls.set(self.cond_calls.get() + 1);
            }
            Ok(x.zeros_like())
        }
    }

    fn process(timesteps: usize, sampling: usize) -> GaussianDiffusion {
        GaussianDiffusion::new(
            DiffusionConfig::new()
                .with_image_size(4)
                .with_num_frames(2)
                .with_timesteps(timesteps)
                .with_sampling_timesteps(sampling)
                .with_ddim_sampling_eta(0.0),
        )
        .unwrap()
    }

    fn cond(batch: usize) -> Conditioning<TestBackend> {
        let device = Default::default();
        Conditioning::new(
            Tensor::zeros([batch, 1, 4, 4], &device),
            Tensor::zeros([batch, 3], &device),
        )
    }

    #[test]
    fn test_ddim_evaluation_count() {
        let denoiser = ZeroDenoiser::new();
        let mut noise = NoiseSource::new(0);
        process(100, 10)
            .sample(&denoiser, &cond(2), 2, 3.0, &mut noise)
            .unwrap();
        assert_eq!(denoiser.cond_calls.get(), 10);
        assert_eq!(denoiser.null_calls.get(), 10);
    }

    #[test]
    fn test_ancestral_evaluation_count() {
        let denoiser = ZeroDenoiser::new();
        let mut noise = NoiseSource::new(0);
        let out = process(12, 12)
            .sample(&denoiser, &cond(1), 1, 1.0, &mut noise)
            .unwrap();
        assert_eq!(out.dims(), [1, 2, 2, 4, 4]);
        assert_eq!(denoiser.cond_calls.get(), 12);
        assert_eq!(denoiser.null_calls.get(), 0);
    }

    #[test]
    fn test_loss_mask_matches_batch() {
        let device = Default::default();
        let denoiser = ZeroDenoiser::new();
        let mut noise = NoiseSource::new(5);
        let target = Tensor::<TestBackend, 5>::zeros([3, 2, 2, 4, 4], &device);

        let loss = process(100, 10)
            .loss(&denoiser, target, &cond(3), &mut noise)
            .unwrap();
        assert_eq!(loss.null_mask.len(), 3);
        assert_eq!(loss.timesteps.len(), 3);
        assert!(loss.value().is_finite());
    }

    #[test]
    fn test_sample_rejects_batch_mismatch_before_any_call() {
        let denoiser = ZeroDenoiser::new();
        let mut noise = NoiseSource::new(0);
        let result = process(100, 10).sample(&denoiser, &cond(1), 2, 2.0, &mut noise);
        assert!(result.is_err());
        assert_eq!(denoiser.cond_calls.get() + denoiser.null_calls.get(), 0);
    }
}
