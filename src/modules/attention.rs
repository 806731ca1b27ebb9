//! Multi-head self-attention
//!
//! Used twice by the denoiser: over the tokens of one frame (spatial) and
//! over the frames at one spatial location (temporal). The module itself is
//! axis-agnostic; callers arrange the sequence axis.
//!
//! Supports memory-efficient sliced attention for long token sequences.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::config::DenoiserConfig;

/// Self-attention over a [batch, seq_len, dim] token sequence
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    q: Linear<B>,
    k: Linear<B>,
    v: Linear<B>,
    o: Linear<B>,
    num_heads: usize,
    head_dim: usize,
    scale: f32,
    /// Query slice length, 0 for full attention
    slice_size: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        let inner = config.heads * config.dim_head;

        Self {
            q: LinearConfig::new(config.dim, inner).with_bias(true).init(device),
            k: LinearConfig::new(config.dim, inner).with_bias(true).init(device),
            v: LinearConfig::new(config.dim, inner).with_bias(true).init(device),
            o: LinearConfig::new(inner, config.dim).with_bias(true).init(device),
            num_heads: config.heads,
            head_dim: config.dim_head,
            scale: 1.0 / (config.dim_head as f32).sqrt(),
            slice_size: config.attention_slice_size,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tokens [batch, seq_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, _dim] = x.dims();

        // [batch, num_heads, seq_len, head_dim]
        let q = self.split_heads(self.q.forward(x.clone()), batch, seq_len);
        let k = self.split_heads(self.k.forward(x.clone()), batch, seq_len);
        let v = self.split_heads(self.v.forward(x), batch, seq_len);

        let out = if self.slice_size > 0 && seq_len > self.slice_size {
            self.sliced_attention(q, k, v)
        } else {
            self.full_attention(q, k, v)
        };

        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.num_heads * self.head_dim]);

        self.o.forward(out)
    }

    fn split_heads(&self, x: Tensor<B, 3>, batch: usize, seq_len: usize) -> Tensor<B, 4> {
        x.reshape([batch, seq_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2)
    }

    fn full_attention(&self, q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
        let attn = q.matmul(k.transpose()) * self.scale;
        softmax(attn, 3).matmul(v)
    }

    /// Attention computed one query slice at a time.
    ///
    /// Peak memory is [slice, seq_len] scores per head instead of [seq_len, seq_len].
    fn sliced_attention(&self, q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, num_heads, seq_len, head_dim] = q.dims();
        let k_t = k.transpose();

        let outputs: Vec<Tensor<B, 4>> = (0..seq_len)
            .step_by(self.slice_size)
            .map(|start| {
                let end = (start + self.slice_size).min(seq_len);
                let q_slice = q
                    .clone()
                    .slice([0..batch, 0..num_heads, start..end, 0..head_dim]);
                let attn = q_slice.matmul(k_t.clone()) * self.scale;
                softmax(attn, 3).matmul(v.clone())
            })
            .collect();

        Tensor::cat(outputs, 2)
    }
}
