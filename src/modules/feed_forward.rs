//! Gated feed-forward network
//!
//! Uses SwiGLU activation (gated linear unit with Swish/SiLU).

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

use crate::config::DenoiserConfig;

/// SwiGLU Feed-Forward Network
///
/// FFN(x) = w2 * (SiLU(w1 * x) * w3 * x)
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Gate projection [dim -> mlp_dim]
    w1: Linear<B>,
    /// Down projection [mlp_dim -> dim]
    w2: Linear<B>,
    /// Up projection [dim -> mlp_dim]
    w3: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        Self {
            w1: LinearConfig::new(config.dim, config.mlp_dim).init(device),
            w2: LinearConfig::new(config.mlp_dim, config.dim).init(device),
            w3: LinearConfig::new(config.dim, config.mlp_dim).init(device),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = silu(self.w1.forward(x.clone()));
        let up = self.w3.forward(x);
        self.w2.forward(gate * up)
    }
}
