//! Denoiser network modules

pub mod attention;
pub mod denoiser;
pub mod embeddings;
pub mod feed_forward;

pub use denoiser::{Conditioning, Denoise, FlowDenoiser};
