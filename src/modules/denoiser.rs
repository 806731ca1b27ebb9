//! Spatio-temporal transformer denoiser
//!
//! Tokens are the pixels of each frame after a per-frame patch convolution.
//! Every block attends within a frame; one temporal layer then attends
//! across frames at each spatial location.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::*;

use super::attention::SelfAttention;
use super::embeddings::{ConditionEmbedding, PatchEmbed, TimestepEmbedder};
use super::feed_forward::FeedForward;
use crate::config::DenoiserConfig;
use crate::error::{FlowDiffusionError, Result};
use crate::guidance::NullConditionMask;

/// Conditioning for one batch.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Reference-image feature map [batch, feature_channels, height, width]
    pub feature: Tensor<B, 4>,
    /// Text embedding [batch, cond_dim]
    pub text: Tensor<B, 2>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(feature: Tensor<B, 4>, text: Tensor<B, 2>) -> Self {
        Self { feature, text }
    }

    pub fn batch_size(&self) -> usize {
        self.feature.dims()[0]
    }
}

/// Anything that predicts the diffusion target from a noisy sample.
///
/// The diffusion process only talks to the network through this trait.
pub trait Denoise<B: Backend> {
    /// Predict ε (or x_0) for `x` [batch, channels, frames, height, width].
    ///
    /// `timesteps` and `null_mask` must both hold one entry per example.
    fn predict(
        &self,
        x: Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        null_mask: &NullConditionMask,
    ) -> Result<Tensor<B, 5>>;
}

/// Pre-norm transformer block: spatial self-attention then gated feed-forward.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: SelfAttention<B>,
    norm2: LayerNorm<B>,
    ffn: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        Self {
            norm1: LayerNormConfig::new(config.dim)
                .with_epsilon(config.norm_eps)
                .init(device),
            attn: SelfAttention::new(config, device),
            norm2: LayerNormConfig::new(config.dim)
                .with_epsilon(config.norm_eps)
                .init(device),
            ffn: FeedForward::new(config, device),
        }
    }

    /// # Arguments
    /// * `x` - Tokens [batch * frames, height * width, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.norm1.forward(x));
        x.clone() + self.ffn.forward(self.norm2.forward(x))
    }
}

/// Pre-norm attention across frames, with a residual connection.
#[derive(Module, Debug)]
pub struct TemporalBlock<B: Backend> {
    norm: LayerNorm<B>,
    attn: SelfAttention<B>,
}

impl<B: Backend> TemporalBlock<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(config.dim)
                .with_epsilon(config.norm_eps)
                .init(device),
            attn: SelfAttention::new(config, device),
        }
    }

    /// # Arguments
    /// * `x` - Tokens [batch, frames, height * width, dim]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, frames, tokens, dim] = x.dims();

        // (b f n d) -> ((n b) f d)
        let seq = x
            .permute([2, 0, 1, 3])
            .reshape([tokens * batch, frames, dim]);
        let seq = seq.clone() + self.attn.forward(self.norm.forward(seq));

        seq.reshape([tokens, batch, frames, dim])
            .permute([1, 2, 0, 3])
    }
}

/// Flow denoiser
///
/// Input: noisy flow stack concatenated with the reference feature map,
/// repeated over frames. Output: prediction with `flow_channels` channels.
#[derive(Module, Debug)]
pub struct FlowDenoiser<B: Backend> {
    patch_embedding: PatchEmbed<B>,
    time_embedding: TimestepEmbedder<B>,
    cond_embedding: ConditionEmbedding<B>,
    blocks: Vec<TransformerBlock<B>>,
    temporal: TemporalBlock<B>,
    /// 1x1x1 projection back to flow channels
    to_out: Conv3d<B>,
    config: Ignored<DenoiserConfig>,
}

impl<B: Backend> FlowDenoiser<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;

        let blocks = (0..config.depth)
            .map(|_| TransformerBlock::new(config, device))
            .collect();

        tracing::debug!(
            dim = config.dim,
            depth = config.depth,
            heads = config.heads,
            "initialized flow denoiser"
        );

        Ok(Self {
            patch_embedding: PatchEmbed::new(config, device),
            time_embedding: TimestepEmbedder::new(config, device),
            cond_embedding: ConditionEmbedding::new(config, device),
            blocks,
            temporal: TemporalBlock::new(config, device),
            to_out: Conv3dConfig::new([config.dim, config.out_channels()], [1, 1, 1]).init(device),
            config: Ignored(config.clone()),
        })
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config.0
    }

    /// Forward pass on already validated inputs
    ///
    /// # Arguments
    /// * `x` - Noisy flow [batch, flow_channels, frames, height, width]
    /// * `timesteps` - Diffusion timesteps as floats [batch]
    /// * `cond` - Reference feature and text embedding
    /// * `null_mask` - 1.0 for null-conditioned examples [batch]
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        timesteps: Tensor<B, 1>,
        cond: &Conditioning<B>,
        null_mask: Tensor<B, 1>,
    ) -> Tensor<B, 5> {
        let [batch, _channels, frames, height, width] = x.dims();
        let [_, feature_channels, _, _] = cond.feature.dims();
        let dim = self.config.0.dim;

        let feature = cond
            .feature
            .clone()
            .unsqueeze_dim::<5>(2)
            .expand([batch, feature_channels, frames, height, width]);
        let x = Tensor::cat(vec![x, feature], 1);

        // [(b f), (h w), dim]
        let tokens = self.patch_embedding.forward(x);

        let emb = self.time_embedding.forward(timesteps)
            + self.cond_embedding.forward(cond.text.clone(), null_mask);
        let tokens = tokens.reshape([batch, frames, height * width, dim])
            + emb.reshape([batch, 1, 1, dim]);

        let mut tokens = tokens.reshape([batch * frames, height * width, dim]);
        for block in &self.blocks {
            tokens = block.forward(tokens);
        }

        let tokens = self
            .temporal
            .forward(tokens.reshape([batch, frames, height * width, dim]));

        let grid = tokens
            .reshape([batch, frames, height, width, dim])
            .permute([0, 4, 1, 2, 3]);
        self.to_out.forward(grid)
    }

    fn check_inputs(
        &self,
        x: &Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        null_mask: &NullConditionMask,
    ) -> Result<()> {
        let config = &self.config.0;
        let [batch, channels, _frames, height, width] = x.dims();
        let [f_batch, f_channels, f_height, f_width] = cond.feature.dims();
        let [t_batch, t_dim] = cond.text.dims();

        FlowDiffusionError::expect_dim("timestep batch", batch, timesteps.len())?;
        FlowDiffusionError::expect_dim("null mask batch", batch, null_mask.len())?;
        FlowDiffusionError::expect_dim("flow channels", config.flow_channels, channels)?;
        FlowDiffusionError::expect_dim("feature batch", batch, f_batch)?;
        FlowDiffusionError::expect_dim("feature channels", config.feature_channels, f_channels)?;
        FlowDiffusionError::expect_dim("feature height", height, f_height)?;
        FlowDiffusionError::expect_dim("feature width", width, f_width)?;
        FlowDiffusionError::expect_dim("text batch", batch, t_batch)?;
        FlowDiffusionError::expect_dim("text dim", config.cond_dim, t_dim)?;
        Ok(())
    }
}

impl<B: Backend> Denoise<B> for FlowDenoiser<B> {
    fn predict(
        &self,
        x: Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        null_mask: &NullConditionMask,
    ) -> Result<Tensor<B, 5>> {
        self.check_inputs(&x, timesteps, cond, null_mask)?;

        let device = x.device();
        let t: Vec<f32> = timesteps.iter().map(|&t| t as f32).collect();
        let t = Tensor::from_data(TensorData::new(t, [timesteps.len()]), &device);

        Ok(self.forward(x, t, cond, null_mask.to_tensor(&device)))
    }
}

impl DenoiserConfig {
    /// Initialize the denoiser
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FlowDenoiser<B>> {
        FlowDenoiser::new(self, device)
    }
}
