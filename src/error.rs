//! Error types for flow diffusion.

use thiserror::Error;

/// Errors raised by schedule construction, the denoiser, the diffusion
/// process, the training orchestrator and checkpoint I/O.
#[derive(Error, Debug)]
pub enum FlowDiffusionError {
    /// Invalid configuration, detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Disagreeing batch, channel or spatial dimensions between tensors.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// NaN or Inf appeared while sampling at the given diffusion timestep.
    #[error("non-finite values produced at diffusion timestep {timestep}")]
    NumericalInstability { timestep: usize },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlowDiffusionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check a dimension and produce a [`FlowDiffusionError::ShapeMismatch`] when it differs.
    pub(crate) fn expect_dim(context: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::ShapeMismatch {
                context,
                expected,
                actual,
            })
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowDiffusionError>;
