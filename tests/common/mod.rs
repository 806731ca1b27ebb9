//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use flowdiff_burn::{
    AverageMeter, Conditioning, Denoise, DenoiserConfig, DiffusionConfig, MotionBridge,
    MotionFrame, NullConditionMask, RenderedFrame, Result, StepReport, TextEncoder,
    TrainingLogger,
};

pub const FEATURE_CHANNELS: usize = 4;
pub const COND_DIM: usize = 6;

/// Small denoiser that keeps tests fast.
pub fn small_denoiser_config() -> DenoiserConfig {
    DenoiserConfig::new()
        .with_dim(16)
        .with_depth(1)
        .with_heads(2)
        .with_dim_head(8)
        .with_mlp_dim(32)
        .with_feature_channels(FEATURE_CHANNELS)
        .with_cond_dim(COND_DIM)
        .with_patch_kernel(3)
}

/// Short schedule over an 8x8, 3-frame flow.
pub fn small_diffusion_config() -> DiffusionConfig {
    DiffusionConfig::new()
        .with_image_size(8)
        .with_num_frames(3)
        .with_timesteps(20)
        .with_sampling_timesteps(5)
}

/// Parameter-free motion model working at image resolution.
///
/// Flow is derived from the difference between driving frame and reference,
/// the feature is the reference's channel mean broadcast over feature channels.
#[derive(Debug, Default)]
pub struct ToyBridge {
    pub extract_calls: Cell<usize>,
    pub render_calls: Cell<usize>,
    pub encode_calls: Cell<usize>,
}

impl ToyBridge {
    fn feature<B: Backend>(reference: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, _, h, w] = reference.dims();
        reference.mean_dim(1).expand([b, FEATURE_CHANNELS, h, w])
    }
}

impl<B: Backend> MotionBridge<B> for ToyBridge {
    fn extract(&self, reference: Tensor<B, 4>, driving: Tensor<B, 4>) -> MotionFrame<B> {
        self.extract_calls.set(self.extract_calls.get() + 1);
        let diff = (driving.clone() - reference.clone()).mean_dim(1).tanh();
        MotionFrame {
            flow: Tensor::cat(vec![diff.clone(), diff.neg()], 1),
            confidence: burn::tensor::activation::sigmoid(driving.mean_dim(1)),
            feature: Self::feature(reference),
        }
    }

    fn render(
        &self,
        reference: Tensor<B, 4>,
        flow: Tensor<B, 4>,
        confidence: Tensor<B, 4>,
    ) -> RenderedFrame<B> {
        self.render_calls.set(self.render_calls.get() + 1);
        let dims = reference.dims();
        RenderedFrame {
            reconstructed: reference.clone() * confidence.expand(dims),
            warped: reference + flow.mean_dim(1).expand(dims),
        }
    }

    fn encode_feature(&self, reference: Tensor<B, 4>) -> Tensor<B, 4> {
        self.encode_calls.set(self.encode_calls.get() + 1);
        Self::feature(reference)
    }
}

/// Embeds a string as its length repeated over the embedding.
pub struct LengthEncoder<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> TextEncoder<B> for LengthEncoder<B> {
    fn embed(&self, texts: &[&str]) -> Tensor<B, 2> {
        let values: Vec<f32> = texts
            .iter()
            .flat_map(|t| std::iter::repeat(t.len() as f32 / 10.0).take(COND_DIM))
            .collect();
        Tensor::from_data(TensorData::new(values, [texts.len(), COND_DIM]), &self.device)
    }
}

/// Predicts a constant and counts conditional and null-conditioned calls.
pub struct CountingDenoiser {
    pub value: f32,
    pub cond_calls: Cell<usize>,
    pub null_calls: Cell<usize>,
    pub mask_lengths: std::cell::RefCell<Vec<usize>>,
}

impl CountingDenoiser {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            cond_calls: Cell::new(0),
            null_calls: Cell::new(0),
            mask_lengths: Default::default(),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.cond_calls.get() + self.null_calls.get()
    }
}

impl<B: Backend> Denoise<B> for CountingDenoiser {
    fn predict(
        &self,
        x: Tensor<B, 5>,
        _timesteps: &[usize],
        _cond: &Conditioning<B>,
        null_mask: &NullConditionMask,
    ) -> Result<Tensor<B, 5>> {
        self.mask_lengths.borrow_mut().push(null_mask.len());
        if null_mask.count_null() > 0 {
            self.null_calls.set(self.null_calls.get() + 1);
        } else {
            self.cond_calls.set(self.cond_calls.get() + 1);
        }
        Ok(x.zeros_like().add_scalar(self.value))
    }
}

/// Forwards to an inner denoiser but always uses the conditional branch.
pub struct ConditionalOnly<'a, D>(pub &'a D);

impl<B: Backend, D: Denoise<B>> Denoise<B> for ConditionalOnly<'_, D> {
    fn predict(
        &self,
        x: Tensor<B, 5>,
        timesteps: &[usize],
        cond: &Conditioning<B>,
        null_mask: &NullConditionMask,
    ) -> Result<Tensor<B, 5>> {
        self.0
            .predict(x, timesteps, cond, &NullConditionMask::none(null_mask.len()))
    }
}

/// Records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    pub epochs: Vec<(usize, f64)>,
    pub steps: Vec<usize>,
    pub non_finite: Vec<usize>,
    pub checkpoints: Vec<(usize, PathBuf)>,
    pub samples: Vec<usize>,
}

impl TrainingLogger for RecordingLogger {
    fn epoch_started(&mut self, epoch: usize, learning_rate: f64) {
        self.epochs.push((epoch, learning_rate));
    }

    fn step(&mut self, report: &StepReport, _losses: &AverageMeter, _batch_time: &AverageMeter) {
        self.steps.push(report.step);
    }

    fn non_finite_loss(&mut self, step: usize, _loss: f32) {
        self.non_finite.push(step);
    }

    fn checkpoint_saved(&mut self, step: usize, path: &Path) {
        self.checkpoints.push((step, path.to_path_buf()));
    }

    fn sample_generated(&mut self, step: usize, _frames: usize) {
        self.samples.push(step);
    }
}

pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec().unwrap()
}

pub fn conditioning<B: Backend>(batch: usize, size: usize, device: &B::Device) -> Conditioning<B> {
    Conditioning::new(
        Tensor::zeros([batch, FEATURE_CHANNELS, size, size], device),
        Tensor::zeros([batch, COND_DIM], device),
    )
}
