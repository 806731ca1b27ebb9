//! Training orchestration, checkpoint resume and pipeline tests.

mod common;

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use flowdiff_burn::{
    Checkpoint, Denoise, DenoiserConfig, DiffusionConfig, FlowDiffusion, FlowDiffusionError, FlowEncoding, FlowRepresentation,
    NoiseSource, NullConditionMask, PipelineBuilder, SampleConfig,
    TextEncoder, TrainingBatch, TrainingConfig, TrainingObjective, TrainingOrchestrator,
};
use tempfile::TempDir;

use common::{
    conditioning, small_denoiser_config, small_diffusion_config, to_vec, LengthEncoder,
    RecordingLogger, ToyBridge,
};

type InferenceBackend = NdArray<f32>;
type TrainBackend = Autodiff<InferenceBackend>;

fn device() -> <InferenceBackend as Backend>::Device {
    Default::default()
}

/// Two examples per step, two steps per epoch, three epochs; all triggers off.
fn training_config(snapshots: &TempDir) -> TrainingConfig {
    TrainingConfig::new()
        .with_batch_size(2)
        .with_num_examples_per_epoch(4)
        .with_max_epoch(3)
        .with_print_freq(1)
        .with_sample_vid_freq(0)
        .with_update_pred_every(0)
        .with_save_pred_every(Some(0))
        .with_snapshot_dir(snapshots.path().to_string_lossy().into_owned())
}

fn orchestrator(
    config: TrainingConfig,
) -> TrainingOrchestrator<TrainBackend, ToyBridge, impl Optimizer<FlowDiffusion<TrainBackend>, TrainBackend>>
{
    orchestrator_with(config, small_diffusion_config(), &small_denoiser_config())
}

fn orchestrator_with(
    config: TrainingConfig,
    diffusion: DiffusionConfig,
    denoiser: &DenoiserConfig,
) -> TrainingOrchestrator<TrainBackend, ToyBridge, impl Optimizer<FlowDiffusion<TrainBackend>, TrainBackend>>
{
    let device = device();
    let model = FlowDiffusion::<TrainBackend>::new(diffusion, denoiser, &device).unwrap();
    let optim = config
        .adam()
        .init::<TrainBackend, FlowDiffusion<TrainBackend>>();
    TrainingOrchestrator::new(model, optim, ToyBridge::default(), config).unwrap()
}

/// Three-frame 8x8 RGB videos for a batch of two.
fn batch(seed: u64) -> TrainingBatch<InferenceBackend> {
    let device = device();
    let video = NoiseSource::new(seed).normal::<InferenceBackend, 5>([2, 3, 3, 8, 8], &device);
    let encoder = LengthEncoder::<InferenceBackend> { device };
    TrainingBatch::from_texts(video, &["a person waving", "nodding"], &encoder)
}

#[test]
fn test_single_step_updates_and_advances() {
    let snapshots = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(training_config(&snapshots));

    let report = orch.step(&batch(0)).unwrap();
    assert_eq!(report.step, 0);
    assert_eq!(report.epoch, 0);
    assert!(!report.skipped);
    assert!(report.loss.is_finite());
    assert_eq!(report.learning_rate, 2e-4);
    assert_eq!(orch.current_step(), 1);
    assert_eq!(orch.losses().count, 2);
    // one extraction per frame
    assert_eq!(orch.bridge().extract_calls.get(), 3);
    assert_eq!(orch.bridge().render_calls.get(), 0);
}

#[test]
fn test_non_finite_loss_skips_update() {
    let snapshots = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(training_config(&snapshots)).with_logger(RecordingLogger::default());

    let device = device();
    let video = Tensor::<InferenceBackend, 5>::full([2, 3, 3, 8, 8], f32::NAN, &device);
    let text = LengthEncoder::<InferenceBackend> { device }.embed(&["a", "b"]);
    let report = orch.step(&TrainingBatch::new(video, text)).unwrap();

    assert!(report.skipped);
    assert_eq!(orch.logger().non_finite, vec![0]);
    assert_eq!(orch.losses().count, 0);
    assert_eq!(orch.current_step(), 1);
}

#[test]
fn test_periodic_triggers_skip_first_step() {
    let snapshots = tempfile::tempdir().unwrap();
    let config = training_config(&snapshots)
        .with_sample_vid_freq(2)
        .with_update_pred_every(2)
        .with_save_pred_every(Some(3));
    let mut orch = orchestrator(config).with_logger(RecordingLogger::default());

    for seed in 0..5 {
        orch.step(&batch(seed)).unwrap();
    }

    let logger = orch.logger();
    assert_eq!(logger.steps, vec![0, 1, 2, 3, 4]);
    assert_eq!(
        logger.epochs.iter().map(|(epoch, _)| *epoch).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(logger.samples, vec![2, 4]);

    let latest = snapshots.path().join("flowdiff");
    let snapshot = snapshots.path().join("flowdiff_B0002_S000003");
    let saved: Vec<_> = logger.checkpoints.iter().map(|(_, path)| path.clone()).collect();
    assert_eq!(saved, vec![latest.clone(), snapshot.clone(), latest.clone()]);

    let meta = Checkpoint::meta(&latest).unwrap();
    assert_eq!(meta.step, 5);
    assert_eq!(meta.examples_processed, 10);
    assert_eq!(Checkpoint::meta(&snapshot).unwrap().step, 4);

    let sample = orch.last_sample().unwrap();
    assert_eq!(sample.num_frames(), 3);
    assert_eq!(sample.reconstructed.dims(), [1, 3, 3, 8, 8]);
    assert_eq!(orch.bridge().extract_calls.get(), 15);
    assert_eq!(orch.bridge().render_calls.get(), 6);
    // samples condition on the reference feature, one encoding each
    assert_eq!(orch.bridge().encode_calls.get(), 2);
}

#[test]
fn test_joint_residual_objective_trains_and_samples() {
    let snapshots = tempfile::tempdir().unwrap();
    let config = training_config(&snapshots)
        .with_objective(TrainingObjective::FlowAndConfidence)
        .with_representation(FlowRepresentation::Residual)
        .with_sample_vid_freq(1);
    let channels = TrainingObjective::FlowAndConfidence.channels();
    let mut orch = orchestrator_with(
        config,
        small_diffusion_config().with_channels(channels),
        &small_denoiser_config().with_flow_channels(channels),
    )
    .with_logger(RecordingLogger::default());

    for seed in 0..2 {
        let report = orch.step(&batch(seed)).unwrap();
        assert!(!report.skipped);
        assert!(report.loss.is_finite());
    }
    assert_eq!(orch.logger().samples, vec![1]);
    assert_eq!(orch.bridge().encode_calls.get(), 1);

    let sample = orch.last_sample().unwrap();
    assert_eq!(sample.flow.dims(), [1, 2, 3, 8, 8]);
    assert_eq!(sample.confidence.dims(), [1, 1, 3, 8, 8]);
    assert!(to_vec(sample.flow.clone()).iter().all(|v| v.is_finite()));
    assert!(to_vec(sample.confidence.clone())
        .iter()
        .all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_fit_stops_at_final_step() {
    let snapshots = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(training_config(&snapshots).with_max_epoch(1));

    let summary = orch.fit(std::iter::repeat(batch(0))).unwrap();
    assert_eq!(summary.steps_run, 2);
    assert_eq!(summary.final_step, 2);
    assert!(summary.mean_loss.is_finite());
    assert_eq!(summary.checkpoint, snapshots.path().join("flowdiff_B0002_S000002"));
    assert!(summary.checkpoint.join("meta.json").is_file());
}

#[test]
fn test_resume_restores_weights_and_position() {
    let device = device();
    let snapshots = tempfile::tempdir().unwrap();
    let config = training_config(&snapshots);

    let mut trained = orchestrator(config.clone());
    let summary = trained
        .fit((0..3).map(batch))
        .unwrap();
    assert_eq!(summary.final_step, 3);
    assert_eq!(Checkpoint::meta(&summary.checkpoint).unwrap().examples_processed, 6);

    let mut resumed = orchestrator(config)
        .resume(summary.checkpoint.clone(), &device)
        .unwrap();
    assert_eq!(resumed.current_step(), 3);

    let x = NoiseSource::new(7).normal::<InferenceBackend, 5>([1, 2, 3, 8, 8], &device);
    let cond = conditioning::<InferenceBackend>(1, 8, &device);
    let mask = NullConditionMask::none(1);
    let expected = trained
        .model()
        .valid()
        .denoiser()
        .predict(x.clone(), &[4], &cond, &mask)
        .unwrap();
    let actual = resumed
        .model()
        .valid()
        .denoiser()
        .predict(x, &[4], &cond, &mask)
        .unwrap();
    let diff: f32 = (expected - actual).abs().max().into_scalar();
    assert!(diff < 1e-6, "max difference {diff}");

    let report = resumed.step(&batch(3)).unwrap();
    assert_eq!(report.step, 3);
    assert_eq!(resumed.current_step(), 4);
}

#[test]
fn test_resume_rejects_different_flow_layout() {
    let device = device();
    let snapshots = tempfile::tempdir().unwrap();
    let config = training_config(&snapshots);

    let summary = orchestrator(config.clone()).fit((0..1).map(batch)).unwrap();
    let result = orchestrator(config.with_representation(FlowRepresentation::Residual))
        .resume(summary.checkpoint, &device);
    assert!(matches!(result, Err(FlowDiffusionError::Config(_))));
}

#[test]
fn test_resume_from_missing_directory_fails() {
    let device = device();
    let snapshots = tempfile::tempdir().unwrap();
    let result = orchestrator(training_config(&snapshots))
        .resume(snapshots.path().join("flowdiff"), &device);
    assert!(matches!(result, Err(FlowDiffusionError::Checkpoint(_))));
}

#[test]
fn test_pipeline_animates_reference() {
    let device = device();
    let pipeline = PipelineBuilder::<InferenceBackend>::new(device.clone())
        .with_diffusion_config(small_diffusion_config())
        .with_denoiser_config(small_denoiser_config())
        .build(ToyBridge::default())
        .unwrap();

    let reference = NoiseSource::new(1).normal::<InferenceBackend, 4>([1, 3, 8, 8], &device);
    let text = LengthEncoder::<InferenceBackend> { device }.embed(&["a person waving"]);
    let config = SampleConfig::guided(2.0).with_seed(11);

    let animated = pipeline.animate(reference.clone(), text.clone(), &config).unwrap();
    assert_eq!(animated.flow.dims(), [1, 2, 3, 8, 8]);
    assert_eq!(animated.confidence.dims(), [1, 1, 3, 8, 8]);
    assert_eq!(animated.reconstructed.dims(), [1, 3, 3, 8, 8]);
    assert_eq!(animated.warped.dims(), [1, 3, 3, 8, 8]);
    assert_eq!(pipeline.bridge.render_calls.get(), 3);

    let again = pipeline.animate(reference, text, &config).unwrap();
    assert_eq!(to_vec(animated.flow), to_vec(again.flow));
}

#[test]
fn test_pipeline_adopts_checkpoint_layout() {
    let snapshots = tempfile::tempdir().unwrap();
    let summary = orchestrator(training_config(&snapshots))
        .fit((0..1).map(batch))
        .unwrap();

    let pipeline = PipelineBuilder::<InferenceBackend>::new(device())
        .with_diffusion_config(small_diffusion_config())
        .with_denoiser_config(small_denoiser_config())
        .with_encoding(FlowEncoding::new(
            TrainingObjective::FlowOnly,
            FlowRepresentation::Residual,
        ))
        .with_checkpoint(summary.checkpoint)
        .build(ToyBridge::default())
        .unwrap();
    assert_eq!(pipeline.encoding().representation, FlowRepresentation::Absolute);
}

#[test]
fn test_pipeline_adopts_checkpoint_architecture() {
    let device = device();
    let snapshots = tempfile::tempdir().unwrap();
    let summary = orchestrator(training_config(&snapshots))
        .fit((0..1).map(batch))
        .unwrap();

    let wider = small_denoiser_config().with_dim(32);
    let pipeline = PipelineBuilder::<InferenceBackend>::new(device.clone())
        .with_diffusion_config(small_diffusion_config().with_num_frames(5))
        .with_denoiser_config(wider.clone())
        .with_checkpoint(summary.checkpoint.clone())
        .build(ToyBridge::default())
        .unwrap();
    assert_eq!(pipeline.model.denoiser().config().dim, 16);
    assert_eq!(pipeline.model.config().num_frames, 3);

    let reference = NoiseSource::new(1).normal::<InferenceBackend, 4>([1, 3, 8, 8], &device);
    let text = LengthEncoder::<InferenceBackend> { device: device.clone() }.embed(&["waving"]);
    let animated = pipeline
        .animate(reference, text, &SampleConfig::default())
        .unwrap();
    assert_eq!(animated.flow.dims(), [1, 2, 3, 8, 8]);

    // loading directly into a model of another width fails before any weights are touched
    let model =
        FlowDiffusion::<InferenceBackend>::new(small_diffusion_config(), &wider, &device).unwrap();
    let result = Checkpoint::load_model(summary.checkpoint, model, &device);
    assert!(matches!(result, Err(FlowDiffusionError::Config(_))));
}

#[test]
fn test_pipeline_rejects_encoding_channel_mismatch() {
    let result = PipelineBuilder::<InferenceBackend>::new(device())
        .with_diffusion_config(small_diffusion_config())
        .with_denoiser_config(small_denoiser_config())
        .with_encoding(FlowEncoding::new(
            TrainingObjective::FlowAndConfidence,
            FlowRepresentation::Absolute,
        ))
        .build(ToyBridge::default());
    assert!(matches!(result, Err(FlowDiffusionError::ShapeMismatch { .. })));
}
