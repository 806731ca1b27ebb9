//! Example: Animate a still image from a text prompt
//!
//! Builds the pipeline (optionally from a checkpoint written by `train_toy`),
//! samples a flow and confidence sequence for the prompt and renders every
//! frame through the toy motion bridge.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example animate --release -- log/toy_snapshots/flowdiff
//! ```

mod toy;

use burn::prelude::*;
use flowdiff_burn::{
    FlowDiffusionPipeline, FlowEncoding, FlowRepresentation, PipelineBuilder, SampleConfig,
    TextEncoder,
};

use toy::backend::{get_device, Backend};
use toy::{HashEncoder, ToyBridge};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Flow Diffusion Animation Example");
    println!("================================\n");

    let device = get_device();
    let mut builder = PipelineBuilder::<Backend>::new(device.clone())
        .with_diffusion_config(toy::diffusion_config())
        .with_denoiser_config(toy::denoiser_config())
        .with_encoding(FlowEncoding::new(toy::OBJECTIVE, FlowRepresentation::Residual));

    match std::env::args().nth(1) {
        Some(dir) => {
            println!("Loading checkpoint: {dir}");
            builder = builder.with_checkpoint(dir);
        }
        None => println!("No checkpoint given. Using random initialization.\n"),
    }
    let pipeline: FlowDiffusionPipeline<Backend, ToyBridge> =
        builder.build(ToyBridge).expect("Failed to build pipeline");

    // first frame of a synthetic clip as the still image
    let clip = toy::moving_square::<Backend>(1, 3, &device);
    let [b, c, _, h, w] = clip.dims();
    let reference = clip.slice([0..b, 0..c, 0..1, 0..h, 0..w]).reshape([b, c, h, w]);

    let encoder = HashEncoder::<Backend> { device };
    for (prompt, scale) in [("a square sliding right", 1.0), ("a square sliding right", 3.0)] {
        println!("Prompt: \"{prompt}\", guidance {scale}");
        let text = encoder.embed(&[prompt]);
        let config = SampleConfig::guided(scale).with_seed(7);

        let animated = pipeline
            .animate(reference.clone(), text, &config)
            .expect("Sampling failed");
        let confidence: f32 = animated.confidence.clone().mean().into_scalar().elem();
        println!(
            "  frames: {}, video shape: {:?}, mean confidence: {:.3}\n",
            animated.num_frames(),
            animated.reconstructed.dims(),
            confidence
        );
    }

    println!("Done!");
}
