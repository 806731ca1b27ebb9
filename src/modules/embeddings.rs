//! Embeddings for the flow denoiser
//!
//! Converts the noisy flow stack into patch tokens and projects timestep
//! and text conditioning into the token dimension.

use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig3d};
use burn::prelude::*;
use burn::tensor::activation::silu;
use burn::tensor::Distribution;

use crate::config::DenoiserConfig;

/// Per-frame patch embedding
///
/// A Conv3d with kernel [1, k, k] and "same" spatial padding: every frame is
/// embedded independently and the token grid keeps the input resolution.
/// Converts [B, C, F, H, W] into tokens [(B F), (H W), dim].
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    conv: Conv3d<B>,
    dim: Ignored<usize>,
}

impl<B: Backend> PatchEmbed<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        let k = config.patch_kernel;
        let pad = k / 2;
        let conv = Conv3dConfig::new([config.in_channels(), config.dim], [1, k, k])
            .with_padding(PaddingConfig3d::Explicit(0, pad, pad))
            .init(device);

        Self {
            conv,
            dim: Ignored(config.dim),
        }
    }

    /// # Arguments
    /// * `x` - Input [batch, channels, frames, height, width]
    ///
    /// # Returns
    /// Tokens [batch * frames, height * width, dim]
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 3> {
        let [batch, _channels, frames, height, width] = x.dims();
        self.conv
            .forward(x)
            .permute([0, 2, 3, 4, 1])
            .reshape([batch * frames, height * width, self.dim.0])
    }
}

/// Fixed sinusoidal embedding of scalar timesteps.
///
/// freq_i = exp(-ln(10000) * i / (half - 1)), output is [sin(t f), cos(t f)].
pub fn sinusoidal_embedding<B: Backend>(t: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = t.device();
    let half = dim / 2;
    let denom = (half.max(2) - 1) as f32;

    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000.0_f32.ln()) * i as f32 / denom).exp())
        .collect();
    let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device);

    // [batch, half]
    let args = t.unsqueeze_dim(1) * freqs.unsqueeze_dim(0);
    Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
}

/// Timestep Embedder
///
/// Sinusoidal encoding followed by Linear, SiLU, Linear.
#[derive(Module, Debug)]
pub struct TimestepEmbedder<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    freq_embed_size: usize,
}

impl<B: Backend> TimestepEmbedder<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(config.dim, config.dim).init(device),
            linear2: LinearConfig::new(config.dim, config.dim).init(device),
            freq_embed_size: config.dim,
        }
    }

    /// # Arguments
    /// * `t` - Integer timesteps as floats [batch]
    pub fn forward(&self, t: Tensor<B, 1>) -> Tensor<B, 2> {
        let t_freq = sinusoidal_embedding(t, self.freq_embed_size);
        self.linear2.forward(silu(self.linear1.forward(t_freq)))
    }
}

/// Text conditioning projection with a learned null embedding
///
/// Null-conditioned examples get the learned `null_embedding` in place of
/// their text vector before the projection, never zeros.
#[derive(Module, Debug)]
pub struct ConditionEmbedding<B: Backend> {
    proj: Linear<B>,
    /// Learned "no condition" vector [cond_dim]
    null_embedding: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConditionEmbedding<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        let null = Tensor::random([config.cond_dim], Distribution::Normal(0.0, 0.02), device);
        Self {
            proj: LinearConfig::new(config.cond_dim, config.dim).init(device),
            null_embedding: Param::from_tensor(null),
        }
    }

    /// # Arguments
    /// * `text` - Text embeddings [batch, cond_dim]
    /// * `null_mask` - 1.0 for null-conditioned examples, 0.0 otherwise [batch]
    ///
    /// # Returns
    /// Conditioning embedding [batch, dim]
    pub fn forward(&self, text: Tensor<B, 2>, null_mask: Tensor<B, 1>) -> Tensor<B, 2> {
        let [batch, cond_dim] = text.dims();
        let mask = null_mask.reshape([batch, 1]);
        let null = self.null_embedding.val().reshape([1, cond_dim]);

        let keep = mask.clone().neg() + 1.0;
        let blended = text * keep + null * mask;
        self.proj.forward(blended)
    }
}
