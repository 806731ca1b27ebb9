//! Flow diffusion configuration
//!
//! Every structural decision (channel counts, schedule length, sampler mode,
//! training objective) is fixed here at construction time.

use burn::config::Config;
use burn::optim::AdamConfig;
use serde::{Deserialize, Serialize};

use crate::error::FlowDiffusionError;

/// Beta schedule used to build the noise schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Cosine schedule with offset s = 0.008 (Nichol & Dhariwal).
    Cosine,
    /// Linear betas from 1e-4 to 2e-2, scaled by 1000 / T.
    Linear,
}

/// What the denoiser is trained to predict. Fixed per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Predict the noise ε added by the forward process.
    PredictNoise,
    /// Predict the clean sample x_0 directly.
    PredictStart,
}

/// Norm used to compare prediction and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossType {
    L1,
    L2,
}

/// Which tensors form the diffusion target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingObjective {
    /// Two flow channels only.
    FlowOnly,
    /// Two flow channels plus the confidence map mapped to [-1, 1].
    FlowAndConfidence,
}

impl TrainingObjective {
    /// Number of channels diffused under this objective.
    pub fn channels(&self) -> usize {
        match self {
            Self::FlowOnly => 2,
            Self::FlowAndConfidence => 3,
        }
    }
}

/// How flow fields are expressed. Never mixed within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRepresentation {
    /// Sampling-grid coordinates as produced by the motion bridge.
    Absolute,
    /// Offset from the identity sampling grid.
    Residual,
}

/// Configuration for the spatio-temporal transformer denoiser
#[derive(Config, Debug)]
pub struct DenoiserConfig {
    /// Token embedding dimension (default: 64)
    #[config(default = 64)]
    pub dim: usize,

    /// Number of spatial transformer blocks (default: 4)
    #[config(default = 4)]
    pub depth: usize,

    /// Number of attention heads (default: 2)
    #[config(default = 2)]
    pub heads: usize,

    /// Per-head dimension (default: 32)
    #[config(default = 32)]
    pub dim_head: usize,

    /// Hidden size of the gated feed-forward (default: 128)
    #[config(default = 128)]
    pub mlp_dim: usize,

    /// Diffused channels: 2 for flow, 3 for flow + confidence (default: 2)
    #[config(default = 2)]
    pub flow_channels: usize,

    /// Channels of the conditioning feature map concatenated to the input (default: 256)
    #[config(default = 256)]
    pub feature_channels: usize,

    /// Text embedding size (default: 768)
    #[config(default = 768)]
    pub cond_dim: usize,

    /// Spatial extent of the patch-embedding kernel, must be odd (default: 7)
    #[config(default = 7)]
    pub patch_kernel: usize,

    /// Layer norm epsilon (default: 1e-5)
    #[config(default = 1e-5)]
    pub norm_eps: f64,

    /// Query slice length for attention, 0 computes full attention (default: 0)
    #[config(default = 0)]
    pub attention_slice_size: usize,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DenoiserConfig {
    /// Channels entering the patch embedding: noisy flow plus conditioning feature.
    pub fn in_channels(&self) -> usize {
        self.flow_channels + self.feature_channels
    }

    /// Channels produced by the output projection.
    pub fn out_channels(&self) -> usize {
        self.flow_channels
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.dim == 0 || self.heads == 0 || self.dim_head == 0 || self.mlp_dim == 0 {
            return Err(FlowDiffusionError::config(
                "denoiser dim, heads, dim_head and mlp_dim must be positive",
            ));
        }
        if self.dim % 2 != 0 || self.dim < 4 {
            return Err(FlowDiffusionError::config(format!(
                "denoiser dim must be even and at least 4 for the sinusoidal embedding, got {}",
                self.dim
            )));
        }
        if !(2..=3).contains(&self.flow_channels) {
            return Err(FlowDiffusionError::config(format!(
                "flow_channels must be 2 or 3, got {}",
                self.flow_channels
            )));
        }
        if self.patch_kernel % 2 == 0 {
            return Err(FlowDiffusionError::config(format!(
                "patch_kernel must be odd, got {}",
                self.patch_kernel
            )));
        }
        Ok(())
    }
}

/// Configuration for the Gaussian diffusion process
#[derive(Config, Debug)]
pub struct DiffusionConfig {
    /// Spatial size of the diffused flow field (default: 32)
    #[config(default = 32)]
    pub image_size: usize,

    /// Number of frames (default: 40)
    #[config(default = 40)]
    pub num_frames: usize,

    /// Diffused channels, must match the denoiser (default: 2)
    #[config(default = 2)]
    pub channels: usize,

    /// Total diffusion steps T (default: 1000)
    #[config(default = 1000)]
    pub timesteps: usize,

    /// Sampling steps; below `timesteps` selects DDIM (default: 250)
    #[config(default = 250)]
    pub sampling_timesteps: usize,

    /// DDIM stochasticity, 0 is deterministic (default: 1.0)
    #[config(default = 1.0)]
    pub ddim_sampling_eta: f64,

    /// Probability of null conditioning during training (default: 0.1)
    #[config(default = 0.1)]
    pub null_cond_prob: f64,

    #[config(default = "BetaSchedule::Cosine")]
    pub beta_schedule: BetaSchedule,

    #[config(default = "LossType::L2")]
    pub loss_type: LossType,

    #[config(default = "Objective::PredictNoise")]
    pub objective: Objective,

    /// Clip x_0 estimates with a per-example percentile bound (default: true)
    #[config(default = true)]
    pub use_dynamic_thres: bool,

    /// Percentile of |x_0| used as the dynamic bound (default: 0.9)
    #[config(default = 0.9)]
    pub dynamic_thres_percentile: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffusionConfig {
    /// Whether sampling runs the accelerated DDIM subsequence.
    pub fn is_ddim_sampling(&self) -> bool {
        self.sampling_timesteps < self.timesteps
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.timesteps == 0 {
            return Err(FlowDiffusionError::config("timesteps must be positive"));
        }
        if self.sampling_timesteps == 0 || self.sampling_timesteps > self.timesteps {
            return Err(FlowDiffusionError::config(format!(
                "sampling_timesteps must be in 1..={}, got {}",
                self.timesteps, self.sampling_timesteps
            )));
        }
        if !(0.0..=1.0).contains(&self.null_cond_prob) {
            return Err(FlowDiffusionError::config(format!(
                "null_cond_prob must be a probability, got {}",
                self.null_cond_prob
            )));
        }
        if self.ddim_sampling_eta < 0.0 {
            return Err(FlowDiffusionError::config("ddim_sampling_eta must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.dynamic_thres_percentile) {
            return Err(FlowDiffusionError::config(format!(
                "dynamic_thres_percentile must be in [0, 1], got {}",
                self.dynamic_thres_percentile
            )));
        }
        if self.image_size == 0 || self.num_frames == 0 {
            return Err(FlowDiffusionError::config("image_size and num_frames must be positive"));
        }
        Ok(())
    }

    /// Check that a denoiser built from `denoiser` can serve this process.
    pub fn validate_with(&self, denoiser: &DenoiserConfig) -> crate::error::Result<()> {
        self.validate()?;
        denoiser.validate()?;
        if self.channels != denoiser.flow_channels {
            return Err(FlowDiffusionError::config(format!(
                "diffusion channels ({}) differ from denoiser flow_channels ({})",
                self.channels, denoiser.flow_channels
            )));
        }
        Ok(())
    }
}

/// Configuration for a training run
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Examples per optimization step (default: 10)
    #[config(default = 10)]
    pub batch_size: usize,

    /// Examples in one pass over the dataset (default: 431)
    #[config(default = 431)]
    pub num_examples_per_epoch: usize,

    /// Number of epochs (default: 159)
    #[config(default = 159)]
    pub max_epoch: usize,

    /// Adam learning rate (default: 2e-4)
    #[config(default = 2e-4)]
    pub learning_rate: f64,

    #[config(default = 0.9)]
    pub adam_beta1: f32,

    #[config(default = 0.99)]
    pub adam_beta2: f32,

    /// Epochs at which the learning rate is multiplied by `lr_gamma`
    #[config(default = "vec![90, 120]")]
    pub lr_milestones: Vec<usize>,

    #[config(default = 0.1)]
    pub lr_gamma: f64,

    /// Seed for every random draw of the run (default: 1234)
    #[config(default = 1234)]
    pub seed: u64,

    /// Log every N steps (default: 2)
    #[config(default = 2)]
    pub print_freq: usize,

    /// Step-tagged snapshot interval; derived from the epoch count when unset
    #[config(default = "None")]
    pub save_pred_every: Option<usize>,

    /// Interval for overwriting the latest checkpoint (default: 400)
    #[config(default = 400)]
    pub update_pred_every: usize,

    /// Interval for generating a sample (default: 400)
    #[config(default = 400)]
    pub sample_vid_freq: usize,

    /// Directory receiving checkpoints
    #[config(default = "String::from(\"log/snapshots\")")]
    pub snapshot_dir: String,

    #[config(default = "TrainingObjective::FlowOnly")]
    pub objective: TrainingObjective,

    #[config(default = "FlowRepresentation::Absolute")]
    pub representation: FlowRepresentation,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingConfig {
    pub fn steps_per_epoch(&self) -> usize {
        self.num_examples_per_epoch.div_ceil(self.batch_size.max(1))
    }

    /// Last optimization step of the run.
    pub fn final_step(&self) -> usize {
        self.steps_per_epoch() * self.max_epoch
    }

    /// Adam with the configured betas; the learning rate is applied per step.
    pub fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.adam_beta1)
            .with_beta_2(self.adam_beta2)
    }

    /// Snapshot interval, a quarter of the run when not set explicitly.
    pub fn snapshot_interval(&self) -> usize {
        self.save_pred_every
            .unwrap_or_else(|| self.steps_per_epoch() * (self.max_epoch / 4))
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.batch_size == 0 {
            return Err(FlowDiffusionError::config("batch_size must be positive"));
        }
        if self.num_examples_per_epoch == 0 {
            return Err(FlowDiffusionError::config("num_examples_per_epoch must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(FlowDiffusionError::config("learning_rate must be positive"));
        }
        if self.lr_milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FlowDiffusionError::config(
                "lr_milestones must be strictly increasing",
            ));
        }
        Ok(())
    }

    /// Check that the diffusion process diffuses the channels this objective needs.
    pub fn validate_with(&self, diffusion: &DiffusionConfig) -> crate::error::Result<()> {
        self.validate()?;
        if self.objective.channels() != diffusion.channels {
            return Err(FlowDiffusionError::config(format!(
                "objective {:?} needs {} diffused channels, diffusion has {}",
                self.objective,
                self.objective.channels(),
                diffusion.channels
            )));
        }
        Ok(())
    }
}

/// Configuration for one sampling call
#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Classifier-free guidance scale (1.0 = conditional branch only)
    pub guidance_scale: f32,
    /// Seed for x_T and every stochastic sampler step
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            guidance_scale: 1.0,
            seed: 1234,
        }
    }
}

impl SampleConfig {
    /// Guided sampling with the given scale.
    pub fn guided(guidance_scale: f32) -> Self {
        Self {
            guidance_scale,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_consistent() {
        let denoiser = DenoiserConfig::default();
        let diffusion = DiffusionConfig::default();
        diffusion.validate_with(&denoiser).unwrap();
        TrainingConfig::default().validate_with(&diffusion).unwrap();
        assert_eq!(denoiser.in_channels(), 258);
        assert!(diffusion.is_ddim_sampling());
    }

    #[test]
    fn test_rejects_sampling_steps_above_total() {
        let config = DiffusionConfig::new()
            .with_timesteps(100)
            .with_sampling_timesteps(101);
        assert!(matches!(config.validate(), Err(FlowDiffusionError::Config(_))));
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let denoiser = DenoiserConfig::new().with_flow_channels(3);
        let diffusion = DiffusionConfig::new();
        assert!(diffusion.validate_with(&denoiser).is_err());

        let training = TrainingConfig::new().with_objective(TrainingObjective::FlowAndConfidence);
        assert!(training.validate_with(&diffusion).is_err());
    }

    #[test]
    fn test_training_schedule_derivations() {
        let config = TrainingConfig::default();
        assert_eq!(config.steps_per_epoch(), 44);
        assert_eq!(config.final_step(), 44 * 159);
        assert_eq!(config.snapshot_interval(), 44 * 39);
        assert_eq!(config.with_save_pred_every(Some(7)).snapshot_interval(), 7);
    }
}
