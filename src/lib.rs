//! Latent flow diffusion for image animation in Burn
//!
//! Generates optical-flow sequences (plus an optional confidence channel)
//! conditioned on a reference image and a text embedding, then animates the
//! reference image by rendering every generated flow frame through a frozen
//! flow-based animator.
//!
//! ## Architecture
//!
//! - **Denoiser**: per-frame patch convolution, spatial transformer blocks, one temporal attention layer
//! - **Diffusion**: cosine or linear noise schedule, ε or x_0 objective, l1 / l2 loss
//! - **Sampling**: ancestral DDPM or DDIM, classifier-free guidance, dynamic thresholding
//! - **Motion bridge**: frozen collaborator extracting flow / confidence / features and rendering frames
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flowdiff_burn::{FlowDiffusionPipeline, SampleConfig};
//!
//! let pipeline = FlowDiffusionPipeline::builder(device)
//!     .with_checkpoint("log/snapshots/flowdiff")
//!     .build(bridge)?;
//!
//! let text = encoder.embed(&["a person waving"]);
//! let video = pipeline.animate(reference, text, &SampleConfig::guided(2.0))?;
//! ```

pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod diffusion;
pub mod error;
pub mod guidance;
pub mod logging;
pub mod modules;
pub mod pipeline;
pub mod rng;
pub mod schedule;
pub mod train;

// Re-export main types
pub use bridge::{
    identity_grid, FlowEncoding, MotionBridge, MotionFrame, MotionStack, RenderedFrame,
    TextEncoder,
};
pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointTag};
pub use config::{
    BetaSchedule, DenoiserConfig, DiffusionConfig, FlowRepresentation, LossType, Objective,
    SampleConfig, TrainingConfig, TrainingObjective,
};
pub use diffusion::{DiffusionLoss, FlowDiffusion, GaussianDiffusion};
pub use error::{FlowDiffusionError, Result};
pub use guidance::{classifier_free_guidance, dynamic_threshold, NullConditionMask};
pub use logging::{TracingLogger, TrainingLogger};
pub use modules::{Conditioning, Denoise, FlowDenoiser};
pub use pipeline::{AnimatedSample, FlowDiffusionPipeline, PipelineBuilder, SampledFlow};
pub use rng::NoiseSource;
pub use schedule::{NoiseSchedule, SamplingMode, SamplingPlan};
pub use train::{
    AverageMeter, FitSummary, MultiStepLr, StepReport, TrainingBatch, TrainingOrchestrator,
};
