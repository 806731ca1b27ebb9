//! Flow diffusion pipeline
//!
//! Caller-facing generation:
//! 1. Encode the reference image with the frozen motion bridge
//! 2. Sample a flow (and confidence) sequence with guided diffusion
//! 3. Render every frame of the reference image through the bridge

use std::path::PathBuf;
use std::time::Instant;

use burn::prelude::*;

use crate::bridge::{frame, FlowEncoding, MotionBridge};
use crate::checkpoint::Checkpoint;
use crate::config::{
    DenoiserConfig, DiffusionConfig, FlowRepresentation, SampleConfig, TrainingObjective,
};
use crate::diffusion::FlowDiffusion;
use crate::error::{FlowDiffusionError, Result};
use crate::modules::Conditioning;
use crate::rng::NoiseSource;

/// Generated flow sequence.
#[derive(Debug, Clone)]
pub struct SampledFlow<B: Backend> {
    /// Absolute sampling grid [batch, 2, frames, h, w]
    pub flow: Tensor<B, 5>,
    /// Confidence in [0, 1] [batch, 1, frames, h, w]
    pub confidence: Tensor<B, 5>,
}

/// Generated flow together with the frames rendered from it.
#[derive(Debug, Clone)]
pub struct AnimatedSample<B: Backend> {
    pub flow: Tensor<B, 5>,
    pub confidence: Tensor<B, 5>,
    /// Generator output [batch, channels, frames, H, W]
    pub reconstructed: Tensor<B, 5>,
    /// Warped reference [batch, channels, frames, H, W]
    pub warped: Tensor<B, 5>,
}

impl<B: Backend> AnimatedSample<B> {
    pub fn num_frames(&self) -> usize {
        self.reconstructed.dims()[2]
    }
}

/// Render each frame of `flow` from `reference` and stack the results on the frame axis.
pub fn render_frames<B: Backend, M: MotionBridge<B>>(
    bridge: &M,
    reference: Tensor<B, 4>,
    flow: Tensor<B, 5>,
    confidence: Tensor<B, 5>,
) -> Result<AnimatedSample<B>> {
    let frames = flow.dims()[2];
    if frames == 0 {
        return Err(FlowDiffusionError::config("cannot render an empty flow sequence"));
    }

    let (reconstructed, warped): (Vec<_>, Vec<_>) = (0..frames)
        .map(|i| {
            let rendered = bridge.render(reference.clone(), frame(&flow, i), frame(&confidence, i));
            (rendered.reconstructed, rendered.warped)
        })
        .unzip();

    Ok(AnimatedSample {
        flow,
        confidence,
        reconstructed: Tensor::stack(reconstructed, 2),
        warped: Tensor::stack(warped, 2),
    })
}

/// Flow diffusion pipeline
///
/// Owns a trained model and the frozen motion bridge it was trained against.
pub struct FlowDiffusionPipeline<B: Backend, M: MotionBridge<B>> {
    pub model: FlowDiffusion<B>,
    pub bridge: M,
    encoding: FlowEncoding,
}

impl<B: Backend, M: MotionBridge<B>> FlowDiffusionPipeline<B, M> {
    pub fn new(model: FlowDiffusion<B>, bridge: M, encoding: FlowEncoding) -> Result<Self> {
        FlowDiffusionError::expect_dim(
            "diffused channels",
            encoding.objective.channels(),
            model.config().channels,
        )?;
        Ok(Self {
            model,
            bridge,
            encoding,
        })
    }

    /// Start building a pipeline on `device`.
    pub fn builder(device: B::Device) -> PipelineBuilder<B> {
        PipelineBuilder::new(device)
    }

    pub fn encoding(&self) -> FlowEncoding {
        self.encoding
    }

    /// Sample flow from a reference feature [batch, feature_channels, h, w]
    /// and a text embedding [batch, cond_dim].
    pub fn sample(
        &self,
        feature: Tensor<B, 4>,
        text: Tensor<B, 2>,
        batch_size: usize,
        config: &SampleConfig,
    ) -> Result<SampledFlow<B>> {
        let start = Instant::now();
        let mut noise = NoiseSource::new(config.seed);
        let cond = Conditioning::new(feature, text);

        let raw = self
            .model
            .sample(&cond, batch_size, config.guidance_scale, &mut noise)?;
        let (flow, confidence) = self.encoding.decode(raw);

        tracing::info!(
            batch_size,
            guidance = config.guidance_scale,
            elapsed_secs = start.elapsed().as_secs_f32(),
            "sampled flow"
        );
        Ok(SampledFlow { flow, confidence })
    }

    /// Animate reference images [batch, channels, H, W] under a text embedding.
    pub fn animate(
        &self,
        reference: Tensor<B, 4>,
        text: Tensor<B, 2>,
        config: &SampleConfig,
    ) -> Result<AnimatedSample<B>> {
        let batch_size = reference.dims()[0];
        let feature = self.bridge.encode_feature(reference.clone());
        let sampled = self.sample(feature, text, batch_size, config)?;

        let start = Instant::now();
        let animated = render_frames(&self.bridge, reference, sampled.flow, sampled.confidence)?;
        tracing::debug!(
            frames = animated.num_frames(),
            elapsed_secs = start.elapsed().as_secs_f32(),
            "rendered frames"
        );
        Ok(animated)
    }
}

/// Builder for [`FlowDiffusionPipeline`]
pub struct PipelineBuilder<B: Backend> {
    device: B::Device,
    diffusion_config: DiffusionConfig,
    denoiser_config: DenoiserConfig,
    checkpoint: Option<PathBuf>,
    encoding: FlowEncoding,
}

impl<B: Backend> PipelineBuilder<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            diffusion_config: DiffusionConfig::default(),
            denoiser_config: DenoiserConfig::default(),
            checkpoint: None,
            encoding: FlowEncoding::new(TrainingObjective::FlowOnly, FlowRepresentation::Absolute),
        }
    }

    pub fn with_diffusion_config(mut self, config: DiffusionConfig) -> Self {
        self.diffusion_config = config;
        self
    }

    pub fn with_denoiser_config(mut self, config: DenoiserConfig) -> Self {
        self.denoiser_config = config;
        self
    }

    /// Load denoiser weights from a checkpoint directory.
    ///
    /// The checkpoint's configs, objective and flow representation replace the builder's.
    pub fn with_checkpoint(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(dir.into());
        self
    }

    pub fn with_encoding(mut self, encoding: FlowEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn build<M: MotionBridge<B>>(self, bridge: M) -> Result<FlowDiffusionPipeline<B, M>> {
        let (model, encoding) = match self.checkpoint {
            Some(dir) => {
                let meta = Checkpoint::meta(&dir)?;
                let model = FlowDiffusion::new(meta.diffusion.clone(), &meta.denoiser, &self.device)?;
                let (model, meta) = Checkpoint::load_model(dir, model, &self.device)?;
                (model, FlowEncoding::new(meta.objective, meta.representation))
            }
            None => (
                FlowDiffusion::new(self.diffusion_config, &self.denoiser_config, &self.device)?,
                self.encoding,
            ),
        };

        FlowDiffusionPipeline::new(model, bridge, encoding)
    }
}
