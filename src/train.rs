//! Training orchestration
//!
//! One step: run the frozen motion bridge over every frame of the batch,
//! encode the flow stack as the diffusion target, compute the diffusion
//! loss and update the denoiser. The bridge lives on the inner (non-autodiff)
//! backend, so its outputs enter the graph as constants.

use std::path::PathBuf;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::bridge::{frame, FlowEncoding, MotionBridge, MotionStack, TextEncoder};
use crate::checkpoint::{Checkpoint, CheckpointMeta, CheckpointTag};
use crate::config::TrainingConfig;
use crate::diffusion::FlowDiffusion;
use crate::error::{FlowDiffusionError, Result};
use crate::logging::{TracingLogger, TrainingLogger};
use crate::modules::Conditioning;
use crate::pipeline::{render_frames, AnimatedSample};
use crate::rng::NoiseSource;

/// One batch of training videos.
#[derive(Debug, Clone)]
pub struct TrainingBatch<B: Backend> {
    /// Reference images [batch, channels, H, W]
    pub reference: Tensor<B, 4>,
    /// Driving videos [batch, channels, frames, H, W]
    pub video: Tensor<B, 5>,
    /// Text embeddings [batch, cond_dim]
    pub text: Tensor<B, 2>,
}

impl<B: Backend> TrainingBatch<B> {
    /// Batch whose reference image is the first frame of each video.
    pub fn new(video: Tensor<B, 5>, text: Tensor<B, 2>) -> Self {
        Self {
            reference: frame(&video, 0),
            video,
            text,
        }
    }

    /// Batch with texts embedded by `encoder`.
    pub fn from_texts<E: TextEncoder<B>>(video: Tensor<B, 5>, texts: &[&str], encoder: &E) -> Self {
        Self::new(video, encoder.embed(texts))
    }

    pub fn batch_size(&self) -> usize {
        self.video.dims()[0]
    }

    fn validate(&self) -> Result<()> {
        let [batch, _, frames, height, width] = self.video.dims();
        let [r_batch, _, r_height, r_width] = self.reference.dims();
        FlowDiffusionError::expect_dim("reference batch", batch, r_batch)?;
        FlowDiffusionError::expect_dim("reference height", height, r_height)?;
        FlowDiffusionError::expect_dim("reference width", width, r_width)?;
        FlowDiffusionError::expect_dim("text batch", batch, self.text.dims()[0])?;
        if frames == 0 {
            return Err(FlowDiffusionError::config("training video has no frames"));
        }
        Ok(())
    }
}

/// Outcome of one optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub epoch: usize,
    pub loss: f32,
    pub learning_rate: f64,
    /// Examples trained with null conditioning
    pub null_conditioned: usize,
    /// The loss was not finite and no update was applied
    pub skipped: bool,
}

/// Summary returned by [`TrainingOrchestrator::fit`].
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub steps_run: usize,
    pub final_step: usize,
    pub mean_loss: f64,
    pub checkpoint: PathBuf,
}

/// Learning rate decayed by `gamma` at each milestone epoch.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

/// Running average of a scalar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        self.avg = self.sum / self.count.max(1) as f64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn every(step: usize, interval: usize) -> bool {
    interval > 0 && step % interval == 0
}

/// Trains a [`FlowDiffusion`] model against a frozen motion bridge.
pub struct TrainingOrchestrator<B, M, O, L = TracingLogger>
where
    B: AutodiffBackend,
    M: MotionBridge<B::InnerBackend>,
    O: Optimizer<FlowDiffusion<B>, B>,
    L: TrainingLogger,
{
    model: FlowDiffusion<B>,
    optim: O,
    bridge: M,
    logger: L,
    config: TrainingConfig,
    encoding: FlowEncoding,
    lr_schedule: MultiStepLr,
    noise: NoiseSource,
    start_step: usize,
    step: usize,
    epoch: Option<usize>,
    losses: AverageMeter,
    batch_time: AverageMeter,
    last_sample: Option<AnimatedSample<B::InnerBackend>>,
}

impl<B, M, O> TrainingOrchestrator<B, M, O, TracingLogger>
where
    B: AutodiffBackend,
    M: MotionBridge<B::InnerBackend>,
    O: Optimizer<FlowDiffusion<B>, B>,
{
    /// Orchestrator starting at step 0, logging through `tracing`.
    pub fn new(model: FlowDiffusion<B>, optim: O, bridge: M, config: TrainingConfig) -> Result<Self> {
        config.validate_with(model.config())?;

        let logger = TracingLogger::new(config.final_step());
        Ok(Self {
            encoding: FlowEncoding::new(config.objective, config.representation),
            lr_schedule: MultiStepLr::new(
                config.learning_rate,
                config.lr_milestones.clone(),
                config.lr_gamma,
            ),
            noise: NoiseSource::new(config.seed),
            model,
            optim,
            bridge,
            logger,
            config,
            start_step: 0,
            step: 0,
            epoch: None,
            losses: AverageMeter::default(),
            batch_time: AverageMeter::default(),
            last_sample: None,
        })
    }
}

impl<B, M, O, L> TrainingOrchestrator<B, M, O, L>
where
    B: AutodiffBackend,
    M: MotionBridge<B::InnerBackend>,
    O: Optimizer<FlowDiffusion<B>, B>,
    L: TrainingLogger,
{
    /// Replace the log sink.
    pub fn with_logger<L2: TrainingLogger>(self, logger: L2) -> TrainingOrchestrator<B, M, O, L2> {
        TrainingOrchestrator {
            model: self.model,
            optim: self.optim,
            bridge: self.bridge,
            logger,
            config: self.config,
            encoding: self.encoding,
            lr_schedule: self.lr_schedule,
            noise: self.noise,
            start_step: self.start_step,
            step: self.step,
            epoch: self.epoch,
            losses: self.losses,
            batch_time: self.batch_time,
            last_sample: self.last_sample,
        }
    }

    /// Restore model and optimizer from `dir` and continue from the step it recorded.
    pub fn resume(mut self, dir: impl Into<PathBuf>, device: &B::Device) -> Result<Self> {
        let dir = dir.into();
        let (model, optim, meta) = Checkpoint::load(
            &dir,
            self.model,
            self.optim,
            self.config.objective,
            self.config.representation,
            device,
        )?;

        self.model = model;
        self.optim = optim;
        self.start_step = meta.resume_step(self.config.batch_size);
        self.step = self.start_step;
        self.epoch = None;

        tracing::info!(
            path = %dir.display(),
            start_step = self.start_step,
            examples = meta.examples_processed,
            "resumed training"
        );
        Ok(self)
    }

    pub fn model(&self) -> &FlowDiffusion<B> {
        &self.model
    }

    pub fn into_model(self) -> FlowDiffusion<B> {
        self.model
    }

    pub fn bridge(&self) -> &M {
        &self.bridge
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// Index of the next step to run.
    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Epoch containing `step`.
    pub fn epoch_for(&self, step: usize) -> usize {
        step / self.config.steps_per_epoch().max(1)
    }

    pub fn losses(&self) -> &AverageMeter {
        &self.losses
    }

    /// Most recent sample generated by the periodic trigger.
    pub fn last_sample(&self) -> Option<&AnimatedSample<B::InnerBackend>> {
        self.last_sample.as_ref()
    }

    /// Run one optimization step, then any trigger due at this step.
    pub fn step(&mut self, batch: &TrainingBatch<B::InnerBackend>) -> Result<StepReport> {
        batch.validate()?;
        let iter_start = Instant::now();
        let actual_step = self.step;
        let batch_size = batch.batch_size();

        let epoch = self.epoch_for(actual_step);
        let learning_rate = self.lr_schedule.lr_at(epoch);
        if self.epoch != Some(epoch) {
            self.epoch = Some(epoch);
            self.logger.epoch_started(epoch, learning_rate);
        }

        let motion = self.extract_motion(batch)?;
        let target = self
            .encoding
            .encode(motion.flow.clone(), motion.confidence.clone());
        let cond = Conditioning::new(
            Tensor::from_inner(motion.feature.clone()),
            Tensor::from_inner(batch.text.clone()),
        );

        let output = self
            .model
            .loss(Tensor::from_inner(target), &cond, &mut self.noise)?;
        let loss = output.value();
        let skipped = !loss.is_finite();

        if skipped {
            self.logger.non_finite_loss(actual_step, loss);
        } else {
            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(learning_rate, self.model.clone(), grads);
            self.losses.update(loss as f64, batch_size);
        }
        self.batch_time
            .update(iter_start.elapsed().as_secs_f64(), 1);
        self.step += 1;

        let report = StepReport {
            step: actual_step,
            epoch,
            loss,
            learning_rate,
            null_conditioned: output.null_mask.count_null(),
            skipped,
        };

        if every(actual_step, self.config.print_freq) {
            self.logger.step(&report, &self.losses, &self.batch_time);
        }

        // no trigger fires on the first step of a run
        if actual_step != self.start_step {
            if every(actual_step, self.config.sample_vid_freq) {
                self.generate_sample(batch, actual_step)?;
            }
            if every(actual_step, self.config.snapshot_interval()) {
                self.save_checkpoint(CheckpointTag::Step {
                    batch_size,
                    step: actual_step,
                })?;
            }
            if every(actual_step, self.config.update_pred_every) {
                self.save_checkpoint(CheckpointTag::Latest)?;
            }
        }

        Ok(report)
    }

    /// Train until the configured final step or until `batches` runs out,
    /// then write a final step-tagged checkpoint.
    ///
    /// Pass a cycling loader to train for the full run.
    pub fn fit<I>(&mut self, batches: I) -> Result<FitSummary>
    where
        I: IntoIterator<Item = TrainingBatch<B::InnerBackend>>,
    {
        let final_step = self.config.final_step();
        let first = self.step;
        let start = Instant::now();

        for batch in batches {
            if self.step >= final_step {
                break;
            }
            self.step(&batch)?;
        }

        let checkpoint = self.save_checkpoint(CheckpointTag::Step {
            batch_size: self.config.batch_size,
            step: self.step,
        })?;
        tracing::info!(
            steps = self.step - first,
            elapsed_secs = start.elapsed().as_secs_f32(),
            "training finished"
        );

        Ok(FitSummary {
            steps_run: self.step - first,
            final_step: self.step,
            mean_loss: self.losses.avg,
            checkpoint,
        })
    }

    /// Save model, optimizer and position under the snapshot directory.
    pub fn save_checkpoint(&mut self, tag: CheckpointTag) -> Result<PathBuf> {
        let dir = tag.dir_in(&self.config.snapshot_dir);
        let meta = CheckpointMeta::describe(
            &self.model,
            self.step,
            self.step * self.config.batch_size,
            self.config.objective,
            self.config.representation,
        );
        Checkpoint::save(&dir, &self.model, &self.optim, &meta)?;
        self.logger.checkpoint_saved(self.step, &dir);
        Ok(dir)
    }

    fn extract_motion(
        &self,
        batch: &TrainingBatch<B::InnerBackend>,
    ) -> Result<MotionStack<B::InnerBackend>> {
        let frames = batch.video.dims()[2];
        let motion = (0..frames)
            .map(|i| {
                self.bridge
                    .extract(batch.reference.clone(), frame(&batch.video, i))
            })
            .collect();
        MotionStack::from_frames(motion)
            .ok_or_else(|| FlowDiffusionError::config("training video has no frames"))
    }

    /// Sample and render the first example of the batch at guidance 1.0.
    fn generate_sample(
        &mut self,
        batch: &TrainingBatch<B::InnerBackend>,
        step: usize,
    ) -> Result<()> {
        let model = self.model.valid();
        let reference = batch.reference.clone().narrow(0, 0, 1);
        let cond = Conditioning::new(
            self.bridge.encode_feature(reference.clone()),
            batch.text.clone().narrow(0, 0, 1),
        );

        let mut noise = self.noise.fork();
        let raw = model.sample(&cond, 1, 1.0, &mut noise)?;
        let (flow, confidence) = self.encoding.decode(raw);
        let animated = render_frames(&self.bridge, reference, flow, confidence)?;

        self.logger.sample_generated(step, animated.num_frames());
        self.last_sample = Some(animated);
        Ok(())
    }
}
