//! Contracts with the frozen motion model and the text encoder
//!
//! The motion bridge turns (reference image, driving frame) pairs into a
//! sampling-grid flow, a confidence map and a conditioning feature, and
//! renders frames back from a flow. It is a read-only collaborator: the
//! trait only takes `&self` and exposes no parameters.

use burn::prelude::*;

use crate::config::{FlowRepresentation, TrainingObjective};

/// Bridge output for one driving frame.
#[derive(Debug, Clone)]
pub struct MotionFrame<B: Backend> {
    /// Sampling grid [batch, 2, h, w], channel 0 is x
    pub flow: Tensor<B, 4>,
    /// Occlusion / visibility weights in [0, 1], [batch, 1, h, w]
    pub confidence: Tensor<B, 4>,
    /// Reference-image feature [batch, feature_channels, h, w]
    pub feature: Tensor<B, 4>,
}

/// Frame rendered from the reference image and a flow.
#[derive(Debug, Clone)]
pub struct RenderedFrame<B: Backend> {
    /// Generator output [batch, channels, H, W]
    pub reconstructed: Tensor<B, 4>,
    /// Reference image warped by the flow [batch, channels, H, W]
    pub warped: Tensor<B, 4>,
}

/// Frozen flow-based image animator.
pub trait MotionBridge<B: Backend> {
    /// Motion from `reference` to `driving`, both [batch, channels, H, W].
    fn extract(&self, reference: Tensor<B, 4>, driving: Tensor<B, 4>) -> MotionFrame<B>;

    /// Animate `reference` with one frame of flow [batch, 2, h, w] and confidence [batch, 1, h, w].
    fn render(
        &self,
        reference: Tensor<B, 4>,
        flow: Tensor<B, 4>,
        confidence: Tensor<B, 4>,
    ) -> RenderedFrame<B>;

    /// Conditioning feature of `reference` alone.
    fn encode_feature(&self, reference: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// External text encoder producing one fixed-size vector per string.
pub trait TextEncoder<B: Backend> {
    /// Embeddings [texts.len(), cond_dim]
    fn embed(&self, texts: &[&str]) -> Tensor<B, 2>;
}

/// Identity sampling grid [batch, 2, frames, h, w] over linspace(-1, 1).
///
/// Channel 0 holds x (varies along width), channel 1 holds y.
pub fn identity_grid<B: Backend>(
    batch: usize,
    frames: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 5> {
    let xs = linspace(width);
    let ys = linspace(height);

    let mut values = Vec::with_capacity(2 * height * width);
    for _ in 0..height {
        values.extend_from_slice(&xs);
    }
    for y in &ys {
        values.extend(std::iter::repeat(*y).take(width));
    }

    Tensor::<B, 5>::from_data(TensorData::new(values, [1, 2, 1, height, width]), device)
        .expand([batch, 2, frames, height, width])
}

fn linspace(n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![-1.0],
        _ => (0..n)
            .map(|i| -1.0 + 2.0 * i as f32 / (n - 1) as f32)
            .collect(),
    }
}

/// Per-frame bridge outputs stacked along a frame axis.
#[derive(Debug, Clone)]
pub struct MotionStack<B: Backend> {
    /// [batch, 2, frames, h, w]
    pub flow: Tensor<B, 5>,
    /// [batch, 1, frames, h, w]
    pub confidence: Tensor<B, 5>,
    /// Feature of the last frame's extraction [batch, feature_channels, h, w]
    pub feature: Tensor<B, 4>,
}

impl<B: Backend> MotionStack<B> {
    /// Stack frames in order. Returns `None` for an empty sequence.
    pub fn from_frames(frames: Vec<MotionFrame<B>>) -> Option<Self> {
        let feature = frames.last()?.feature.clone();
        let (flows, confidences): (Vec<_>, Vec<_>) = frames
            .into_iter()
            .map(|frame| (frame.flow, frame.confidence))
            .unzip();

        Some(Self {
            flow: Tensor::stack(flows, 2),
            confidence: Tensor::stack(confidences, 2),
            feature,
        })
    }
}

/// How flow and confidence are laid out in the diffused tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEncoding {
    pub objective: TrainingObjective,
    pub representation: FlowRepresentation,
}

impl FlowEncoding {
    pub fn new(objective: TrainingObjective, representation: FlowRepresentation) -> Self {
        Self {
            objective,
            representation,
        }
    }

    /// Diffusion target from a flow [b, 2, f, h, w] and confidence [b, 1, f, h, w].
    pub fn encode<B: Backend>(&self, flow: Tensor<B, 5>, confidence: Tensor<B, 5>) -> Tensor<B, 5> {
        let flow = match self.representation {
            FlowRepresentation::Absolute => flow,
            FlowRepresentation::Residual => {
                let [b, _, f, h, w] = flow.dims();
                let grid = identity_grid::<B>(b, f, h, w, &flow.device());
                flow - grid
            }
        };

        match self.objective {
            TrainingObjective::FlowOnly => flow,
            TrainingObjective::FlowAndConfidence => {
                Tensor::cat(vec![flow, confidence * 2.0 - 1.0], 1)
            }
        }
    }

    /// Split a sample back into an absolute flow and a confidence in [0, 1].
    ///
    /// Flow-only samples get an all-ones confidence.
    pub fn decode<B: Backend>(&self, sample: Tensor<B, 5>) -> (Tensor<B, 5>, Tensor<B, 5>) {
        let [b, _, f, h, w] = sample.dims();
        let device = sample.device();

        let flow = sample.clone().slice([0..b, 0..2, 0..f, 0..h, 0..w]);
        let flow = match self.representation {
            FlowRepresentation::Absolute => flow,
            FlowRepresentation::Residual => flow + identity_grid::<B>(b, f, h, w, &device),
        };

        let confidence = match self.objective {
            TrainingObjective::FlowOnly => Tensor::ones([b, 1, f, h, w], &device),
            TrainingObjective::FlowAndConfidence => {
                let c = sample.slice([0..b, 2..3, 0..f, 0..h, 0..w]);
                ((c + 1.0) * 0.5).clamp(0.0, 1.0)
            }
        };

        (flow, confidence)
    }
}

/// Frame `index` of a [b, c, f, h, w] stack as [b, c, h, w].
pub(crate) fn frame<B: Backend>(stack: &Tensor<B, 5>, index: usize) -> Tensor<B, 4> {
    let [b, c, _, h, w] = stack.dims();
    stack
        .clone()
        .slice([0..b, 0..c, index..index + 1, 0..h, 0..w])
        .reshape([b, c, h, w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_identity_grid_layout() {
        let device = Default::default();
        let grid = identity_grid::<TestBackend>(1, 1, 2, 3, &device);
        assert_eq!(grid.dims(), [1, 2, 1, 2, 3]);
        assert_eq!(
            to_vec(grid),
            vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_single_pixel_grid() {
        let device = Default::default();
        let grid = identity_grid::<TestBackend>(2, 3, 1, 1, &device);
        assert!(to_vec(grid).iter().all(|v| *v == -1.0));
    }

    #[test]
    fn test_residual_joint_encoding_inverts() {
        let device = Default::default();
        let encoding = FlowEncoding::new(
            TrainingObjective::FlowAndConfidence,
            FlowRepresentation::Residual,
        );
        let flow = identity_grid::<TestBackend>(1, 2, 3, 3, &device) * 0.5;
        let confidence = Tensor::<TestBackend, 5>::full([1, 1, 2, 3, 3], 0.25, &device);

        let target = encoding.encode(flow.clone(), confidence.clone());
        assert_eq!(target.dims(), [1, 3, 2, 3, 3]);

        let (flow_back, conf_back) = encoding.decode(target);
        let diff: f32 = (flow_back - flow).abs().max().into_scalar();
        assert!(diff < 1e-6);
        assert!(to_vec(conf_back).iter().all(|c| (c - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_flow_only_decodes_full_confidence() {
        let device = Default::default();
        let encoding = FlowEncoding::new(TrainingObjective::FlowOnly, FlowRepresentation::Absolute);
        let (flow, conf) = encoding.decode(Tensor::<TestBackend, 5>::zeros([2, 2, 1, 2, 2], &device));
        assert_eq!(flow.dims(), [2, 2, 1, 2, 2]);
        assert!(to_vec(conf).iter().all(|c| *c == 1.0));
    }
}
