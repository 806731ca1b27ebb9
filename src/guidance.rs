//! Classifier-free guidance and x_0 thresholding.
//!
//! Guidance combines the conditional and null-conditioned predictions:
//!   ε̂ = ε_null + s * (ε_cond - ε_null)
//! Dynamic thresholding bounds each example's x_0 estimate by a percentile
//! of its own absolute values before renormalizing to [-1, 1].

use burn::prelude::*;

/// Per-example flag marking which examples have their text conditioning
/// replaced by the learned null embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullConditionMask {
    mask: Vec<bool>,
}

impl NullConditionMask {
    pub fn from_vec(mask: Vec<bool>) -> Self {
        Self { mask }
    }

    /// Every example keeps its conditioning.
    pub fn none(batch_size: usize) -> Self {
        Self::from_vec(vec![false; batch_size])
    }

    /// Every example is null-conditioned.
    pub fn all(batch_size: usize) -> Self {
        Self::from_vec(vec![true; batch_size])
    }

    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.mask.iter().copied()
    }

    /// Number of null-conditioned examples.
    pub fn count_null(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    /// 1.0 where the example is null-conditioned, 0.0 elsewhere.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        let values: Vec<f32> = self.iter().map(|m| if m { 1.0 } else { 0.0 }).collect();
        Tensor::from_data(TensorData::new(values, [self.len()]), device)
    }
}

/// ε_null + scale * (ε_cond - ε_null)
///
/// Scale 1.0 returns the conditional prediction, 0.0 the null one.
pub fn classifier_free_guidance<B: Backend, const D: usize>(
    cond: Tensor<B, D>,
    null: Tensor<B, D>,
    scale: f32,
) -> Tensor<B, D> {
    null.clone() + (cond - null) * scale
}

/// Dynamic thresholding of an x_0 estimate shaped [batch, c, f, h, w].
///
/// For each example, s = max(quantile(|x_0|, percentile), 1); values are
/// clamped to [-s, s] and divided by s, so the result lies in [-1, 1].
pub fn dynamic_threshold<B: Backend>(x_start: Tensor<B, 5>, percentile: f64) -> Tensor<B, 5> {
    let dims = x_start.dims();
    let batch = dims[0];
    let per_example = dims[1..].iter().product::<usize>();
    let device = x_start.device();

    let data = x_start.clone().abs().into_data();
    let values: Vec<f32> = data.iter::<f32>().collect();
    let bounds: Vec<f32> = values
        .chunks(per_example.max(1))
        .take(batch)
        .map(|chunk| quantile(chunk, percentile).max(1.0))
        .collect();

    let s = Tensor::<B, 5>::from_data(TensorData::new(bounds, [batch, 1, 1, 1, 1]), &device)
        .expand(dims);
    x_start
        .max_pair(s.clone().neg())
        .min_pair(s.clone())
        .div(s)
}

/// Static fallback: clamp the x_0 estimate to [-1, 1].
pub fn static_threshold<B: Backend>(x_start: Tensor<B, 5>) -> Tensor<B, 5> {
    x_start.clamp(-1.0, 1.0)
}

/// Quantile with linear interpolation between the closest ranks.
pub fn quantile(values: &[f32], q: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
