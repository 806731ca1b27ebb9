//! Shared pieces for the demos: backend selection, a parameter-free motion
//! bridge, a hashing text encoder and synthetic moving-square videos.

#![allow(dead_code)]

use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use flowdiff_burn::{
    identity_grid, DenoiserConfig, DiffusionConfig, MotionBridge, MotionFrame, RenderedFrame,
    TextEncoder, TrainingObjective,
};

pub const IMAGE_SIZE: usize = 16;
pub const NUM_FRAMES: usize = 8;
pub const FEATURE_CHANNELS: usize = 8;
pub const COND_DIM: usize = 16;
pub const OBJECTIVE: TrainingObjective = TrainingObjective::FlowAndConfidence;

// Backend and device type selection based on features
#[cfg(feature = "cuda")]
pub mod backend {
    pub type Backend = burn::backend::Cuda;

    pub fn get_device() -> burn::backend::cuda::CudaDevice {
        Default::default()
    }
}

#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub mod backend {
    pub type Backend = burn::backend::Wgpu;

    pub fn get_device() -> burn::backend::wgpu::WgpuDevice {
        Default::default()
    }
}

#[cfg(all(feature = "cpu", not(feature = "wgpu"), not(feature = "cuda")))]
pub mod backend {
    pub type Backend = burn::backend::ndarray::NdArray<f32>;

    pub fn get_device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::Cpu
    }
}

pub fn denoiser_config() -> DenoiserConfig {
    DenoiserConfig::new()
        .with_dim(32)
        .with_depth(2)
        .with_heads(2)
        .with_dim_head(16)
        .with_mlp_dim(64)
        .with_flow_channels(OBJECTIVE.channels())
        .with_feature_channels(FEATURE_CHANNELS)
        .with_cond_dim(COND_DIM)
        .with_patch_kernel(3)
}

pub fn diffusion_config() -> DiffusionConfig {
    DiffusionConfig::new()
        .with_image_size(IMAGE_SIZE)
        .with_num_frames(NUM_FRAMES)
        .with_channels(OBJECTIVE.channels())
        .with_timesteps(100)
        .with_sampling_timesteps(20)
}

/// Motion bridge without parameters, working at image resolution.
///
/// Flow is the identity grid displaced by the frame difference; rendering
/// shifts the reference by the mean displacement.
pub struct ToyBridge;

impl<B: Backend> MotionBridge<B> for ToyBridge {
    fn extract(&self, reference: Tensor<B, 4>, driving: Tensor<B, 4>) -> MotionFrame<B> {
        let [b, _, h, w] = reference.dims();
        let diff = (driving - reference.clone()).mean_dim(1);
        let grid = identity_grid::<B>(b, 1, h, w, &reference.device()).reshape([b, 2, h, w]);

        MotionFrame {
            flow: grid + diff.clone().tanh().expand([b, 2, h, w]) * 0.1,
            confidence: sigmoid(diff.abs().neg() * 4.0 + 2.0),
            feature: <Self as MotionBridge<B>>::encode_feature(self, reference),
        }
    }

    fn render(
        &self,
        reference: Tensor<B, 4>,
        flow: Tensor<B, 4>,
        confidence: Tensor<B, 4>,
    ) -> RenderedFrame<B> {
        let dims = reference.dims();
        let [b, _, h, w] = dims;
        let grid = identity_grid::<B>(b, 1, h, w, &reference.device()).reshape([b, 2, h, w]);
        let displacement = (flow - grid).mean_dim(1).expand(dims);

        let warped = reference.clone() + displacement;
        RenderedFrame {
            reconstructed: warped.clone() * confidence.clone().expand(dims)
                + reference * (confidence.neg() + 1.0).expand(dims),
            warped,
        }
    }

    fn encode_feature(&self, reference: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, _, h, w] = reference.dims();
        let scales: Vec<f32> = (0..FEATURE_CHANNELS).map(|i| (i + 1) as f32 / 4.0).collect();
        let scales = Tensor::<B, 1>::from_floats(scales.as_slice(), &reference.device())
            .reshape([1, FEATURE_CHANNELS, 1, 1]);
        reference.mean_dim(1).expand([b, FEATURE_CHANNELS, h, w]) * scales
    }
}

/// Embeds each string from its bytes into `COND_DIM` values in [-1, 1].
pub struct HashEncoder<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> TextEncoder<B> for HashEncoder<B> {
    fn embed(&self, texts: &[&str]) -> Tensor<B, 2> {
        let values: Vec<f32> = texts
            .iter()
            .flat_map(|text| {
                let seed = text
                    .bytes()
                    .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                (0..COND_DIM).map(move |i| ((seed as f32) * 1e-3 + i as f32).sin())
            })
            .collect();
        Tensor::from_data(TensorData::new(values, [texts.len(), COND_DIM]), &self.device)
    }
}

/// A bright square moving one pixel per frame, [batch, 3, NUM_FRAMES, IMAGE_SIZE, IMAGE_SIZE].
///
/// `offset` picks the starting column so consecutive batches differ.
pub fn moving_square<B: Backend>(batch: usize, offset: usize, device: &B::Device) -> Tensor<B, 5> {
    let size = IMAGE_SIZE;
    let side = size / 4;
    let mut values = vec![0.0f32; batch * 3 * NUM_FRAMES * size * size];

    for n in 0..batch {
        let row = (n * 3 + offset) % (size - side);
        for c in 0..3 {
            for f in 0..NUM_FRAMES {
                let col = (offset + f) % (size - side);
                let base = (((n * 3 + c) * NUM_FRAMES) + f) * size * size;
                for y in row..row + side {
                    for x in col..col + side {
                        values[base + y * size + x] = 1.0;
                    }
                }
            }
        }
    }

    Tensor::from_data(
        TensorData::new(values, [batch, 3, NUM_FRAMES, size, size]),
        device,
    )
}
