//! Example: Train the flow diffusion model on synthetic moving squares
//!
//! The motion bridge and text encoder are toy stand-ins, so this runs in
//! seconds on a CPU and exercises the whole training loop: per-frame motion
//! extraction, the diffusion loss, Adam updates, periodic samples and
//! checkpoints.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example train_toy --release
//!
//! # Resume from a checkpoint written by a previous run
//! cargo run --example train_toy --release -- log/toy_snapshots/flowdiff
//! ```

mod toy;

use burn::backend::Autodiff;
use flowdiff_burn::{
    FlowDiffusion, FlowRepresentation, TrainingBatch, TrainingConfig, TrainingOrchestrator,
};

use toy::backend::{get_device, Backend};
use toy::{HashEncoder, ToyBridge};

type TrainBackend = Autodiff<Backend>;

const PROMPTS: [&str; 2] = ["a square sliding right", "a square drifting"];

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let device = get_device();
    let resume_from = std::env::args().nth(1);

    let config = TrainingConfig::new()
        .with_batch_size(2)
        .with_num_examples_per_epoch(8)
        .with_max_epoch(6)
        .with_learning_rate(1e-3)
        .with_lr_milestones(vec![4])
        .with_print_freq(1)
        .with_sample_vid_freq(4)
        .with_update_pred_every(4)
        .with_save_pred_every(Some(8))
        .with_snapshot_dir("log/toy_snapshots".to_string())
        .with_objective(toy::OBJECTIVE)
        .with_representation(FlowRepresentation::Residual);

    let model = FlowDiffusion::<TrainBackend>::new(
        toy::diffusion_config(),
        &toy::denoiser_config(),
        &device,
    )
    .expect("Invalid model configuration");
    let optim = config
        .adam()
        .init::<TrainBackend, FlowDiffusion<TrainBackend>>();

    let mut orchestrator = TrainingOrchestrator::new(model, optim, ToyBridge, config.clone())
        .expect("Invalid training configuration");
    if let Some(dir) = resume_from {
        orchestrator = orchestrator
            .resume(dir, &device)
            .expect("Failed to resume from checkpoint");
    }

    println!("Flow Diffusion Toy Training");
    println!("===========================\n");
    println!("  - Steps per epoch: {}", config.steps_per_epoch());
    println!("  - Final step: {}", config.final_step());
    println!("  - Starting at step: {}\n", orchestrator.current_step());

    let encoder = HashEncoder::<Backend> {
        device: device.clone(),
    };
    let batches = (0..).map(|i| {
        let video = toy::moving_square::<Backend>(config.batch_size, i, &device);
        TrainingBatch::from_texts(video, &PROMPTS, &encoder)
    });

    let summary = orchestrator.fit(batches).expect("Training failed");

    println!("\nRan {} steps, mean loss {:.5}", summary.steps_run, summary.mean_loss);
    println!("Final checkpoint: {}", summary.checkpoint.display());
    if let Some(sample) = orchestrator.last_sample() {
        println!(
            "Last sample: {} frames, reconstructed {:?}",
            sample.num_frames(),
            sample.reconstructed.dims()
        );
    }
}
