//! Noise schedule for Gaussian flow diffusion
//!
//! Precomputes the per-timestep table used by both directions of the process.
//! The forward process corrupts a clean sample x_0 as
//!   x_t = sqrt(ᾱ_t) * x_0 + sqrt(1 - ᾱ_t) * ε
//! and the reverse process uses the posterior q(x_{t-1} | x_t, x_0).

use burn::prelude::*;

use crate::config::BetaSchedule;
use crate::error::{FlowDiffusionError, Result};

/// Immutable table of schedule coefficients, indexed by timestep `0..T`.
///
/// Built once at model construction and never mutated.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_variance: Vec<f64>,
    /// Log of the posterior variance, floored at 1e-20 so t = 0 stays finite.
    pub posterior_log_variance_clipped: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the table for `timesteps` diffusion steps.
    pub fn new(kind: BetaSchedule, timesteps: usize) -> Result<Self> {
        if timesteps == 0 {
            return Err(FlowDiffusionError::config("timesteps must be positive"));
        }
        let betas = match kind {
            BetaSchedule::Cosine => cosine_betas(timesteps, 0.008),
            BetaSchedule::Linear => linear_betas(timesteps),
        };
        tracing::debug!(?kind, timesteps, "building noise schedule");
        Ok(Self::from_betas(betas))
    }

    /// Build the table from explicit betas.
    pub fn from_betas(betas: Vec<f64>) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0f64;
        for beta in &betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(betas.len())
            .collect();

        let posterior_variance: Vec<f64> = betas
            .iter()
            .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
            .map(|(beta, (ac, ac_prev))| beta * (1.0 - ac_prev) / (1.0 - ac))
            .collect();

        Self {
            sqrt_alphas_cumprod: alphas_cumprod.iter().map(|a| a.sqrt()).collect(),
            sqrt_one_minus_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect(),
            sqrt_recip_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect(),
            sqrt_recipm1_alphas_cumprod: alphas_cumprod
                .iter()
                .map(|a| (1.0 / a - 1.0).sqrt())
                .collect(),
            posterior_log_variance_clipped: posterior_variance
                .iter()
                .map(|v| v.max(1e-20).ln())
                .collect(),
            posterior_mean_coef1: betas
                .iter()
                .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
                .map(|(beta, (ac, ac_prev))| beta * ac_prev.sqrt() / (1.0 - ac))
                .collect(),
            posterior_mean_coef2: betas
                .iter()
                .zip(alphas_cumprod.iter().zip(&alphas_cumprod_prev))
                .map(|(beta, (ac, ac_prev))| (1.0 - ac_prev) * (1.0 - beta).sqrt() / (1.0 - ac))
                .collect(),
            posterior_variance,
            alphas_cumprod_prev,
            alphas_cumprod,
            betas,
        }
    }

    /// Total number of diffusion steps T.
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// Sampling plan for `sampling_timesteps` denoiser evaluations.
    ///
    /// Uses full ancestral sampling when every timestep is visited, the DDIM
    /// subsequence otherwise.
    pub fn sampling_plan(&self, sampling_timesteps: usize, eta: f64) -> Result<SamplingPlan> {
        let total = self.num_timesteps();
        if sampling_timesteps == 0 || sampling_timesteps > total {
            return Err(FlowDiffusionError::config(format!(
                "sampling_timesteps must be in 1..={total}, got {sampling_timesteps}"
            )));
        }

        if sampling_timesteps == total {
            let steps = (0..total)
                .rev()
                .map(|t| SamplingStep {
                    timestep: t,
                    next: t.checked_sub(1),
                })
                .collect();
            return Ok(SamplingPlan {
                mode: SamplingMode::Ancestral,
                steps,
            });
        }

        // trunc(linspace(-1, T - 1, S + 1)), walked in descending pairs
        let times: Vec<i64> = (0..=sampling_timesteps)
            .map(|i| (-1.0 + i as f64 * total as f64 / sampling_timesteps as f64) as i64)
            .collect();
        let steps = times
            .windows(2)
            .rev()
            .map(|pair| SamplingStep {
                timestep: pair[1] as usize,
                next: usize::try_from(pair[0]).ok(),
            })
            .collect();

        Ok(SamplingPlan {
            mode: SamplingMode::Ddim { eta },
            steps,
        })
    }

    /// Gather `table[t]` for each example as a broadcastable [batch, 1, 1, 1, 1] tensor.
    pub fn extract<B: Backend>(
        table: &[f64],
        timesteps: &[usize],
        device: &B::Device,
    ) -> Tensor<B, 5> {
        let values: Vec<f32> = timesteps.iter().map(|&t| table[t] as f32).collect();
        Tensor::from_data(TensorData::new(values, [timesteps.len(), 1, 1, 1, 1]), device)
    }

    /// Forward corruption: x_t = sqrt(ᾱ_t) x_0 + sqrt(1 - ᾱ_t) ε
    pub fn q_sample<B: Backend>(
        &self,
        x_start: Tensor<B, 5>,
        timesteps: &[usize],
        noise: Tensor<B, 5>,
    ) -> Tensor<B, 5> {
        let device = x_start.device();
        let a = Self::extract::<B>(&self.sqrt_alphas_cumprod, timesteps, &device);
        let s = Self::extract::<B>(&self.sqrt_one_minus_alphas_cumprod, timesteps, &device);
        x_start * a + noise * s
    }

    /// Invert the forward formula for x_0 given x_t and ε.
    pub fn predict_start_from_noise<B: Backend>(
        &self,
        x_t: Tensor<B, 5>,
        timesteps: &[usize],
        noise: Tensor<B, 5>,
    ) -> Tensor<B, 5> {
        let device = x_t.device();
        let recip = Self::extract::<B>(&self.sqrt_recip_alphas_cumprod, timesteps, &device);
        let recipm1 = Self::extract::<B>(&self.sqrt_recipm1_alphas_cumprod, timesteps, &device);
        x_t * recip - noise * recipm1
    }

    /// Invert the forward formula for ε given x_t and x_0.
    pub fn predict_noise_from_start<B: Backend>(
        &self,
        x_t: Tensor<B, 5>,
        timesteps: &[usize],
        x_start: Tensor<B, 5>,
    ) -> Tensor<B, 5> {
        let device = x_t.device();
        let recip = Self::extract::<B>(&self.sqrt_recip_alphas_cumprod, timesteps, &device);
        let recipm1 = Self::extract::<B>(&self.sqrt_recipm1_alphas_cumprod, timesteps, &device);
        (x_t * recip - x_start) / recipm1
    }

    /// Posterior q(x_{t-1} | x_t, x_0): returns (mean, log variance).
    pub fn q_posterior<B: Backend>(
        &self,
        x_start: Tensor<B, 5>,
        x_t: Tensor<B, 5>,
        timesteps: &[usize],
    ) -> (Tensor<B, 5>, Tensor<B, 5>) {
        let device = x_t.device();
        let c1 = Self::extract::<B>(&self.posterior_mean_coef1, timesteps, &device);
        let c2 = Self::extract::<B>(&self.posterior_mean_coef2, timesteps, &device);
        let log_var =
            Self::extract::<B>(&self.posterior_log_variance_clipped, timesteps, &device);
        (x_start * c1 + x_t * c2, log_var)
    }
}

/// How the reverse process moves between timesteps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    /// DDPM: sample from the posterior at every timestep.
    Ancestral,
    /// DDIM over a timestep subsequence; `eta == 0` is deterministic.
    Ddim { eta: f64 },
}

/// One denoiser evaluation of the reverse process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingStep {
    /// Timestep the denoiser is evaluated at.
    pub timestep: usize,
    /// Timestep reached after the update, `None` for the final jump to x_0.
    pub next: Option<usize>,
}

/// Ordered, finite list of reverse steps, from most to least noisy.
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub mode: SamplingMode,
    pub steps: Vec<SamplingStep>,
}

impl SamplingPlan {
    /// Number of denoiser evaluations (per guidance branch).
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn cosine_betas(timesteps: usize, s: f64) -> Vec<f64> {
    let total = timesteps as f64;
    let f = |t: usize| {
        (((t as f64 / total) + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2)
            .cos()
            .powi(2)
    };
    let f0 = f(0);
    (0..timesteps)
        .map(|t| {
            let beta = 1.0 - (f(t + 1) / f0) / (f(t) / f0);
            beta.clamp(0.0, 0.9999)
        })
        .collect()
}

fn linear_betas(timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / timesteps as f64;
    let (start, end) = (scale * 1e-4, scale * 2e-2);
    if timesteps == 1 {
        return vec![start];
    }
    (0..timesteps)
        .map(|i| start + (end - start) * i as f64 / (timesteps - 1) as f64)
        .collect()
}
