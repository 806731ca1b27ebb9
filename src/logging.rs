//! Training log sink
//!
//! The orchestrator reports through a [`TrainingLogger`] it owns, so runs
//! never touch process-wide logging state. [`TracingLogger`] forwards
//! everything to `tracing`.

use std::path::Path;

use crate::train::{AverageMeter, StepReport};

/// Receives training events. Every method defaults to doing nothing.
pub trait TrainingLogger {
    fn epoch_started(&mut self, _epoch: usize, _learning_rate: f64) {}

    /// Called every `print_freq` steps with the running meters.
    fn step(&mut self, _report: &StepReport, _losses: &AverageMeter, _batch_time: &AverageMeter) {}

    /// The step's loss was NaN or Inf; no update was applied.
    fn non_finite_loss(&mut self, _step: usize, _loss: f32) {}

    fn checkpoint_saved(&mut self, _step: usize, _path: &Path) {}

    fn sample_generated(&mut self, _step: usize, _frames: usize) {}
}

/// Logger backed by `tracing` macros.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    final_step: usize,
}

impl TracingLogger {
    pub fn new(final_step: usize) -> Self {
        Self { final_step }
    }
}

impl TrainingLogger for TracingLogger {
    fn epoch_started(&mut self, epoch: usize, learning_rate: f64) {
        tracing::info!(epoch, lr = learning_rate, "epoch started");
    }

    fn step(&mut self, report: &StepReport, losses: &AverageMeter, batch_time: &AverageMeter) {
        tracing::info!(
            "iter: [{}]{}/{}\tloss {:.7} ({:.7})\ttime {:.3} ({:.3})\tlr {:.7}",
            report.epoch,
            report.step,
            self.final_step,
            losses.val,
            losses.avg,
            batch_time.val,
            batch_time.avg,
            report.learning_rate,
        );
    }

    fn non_finite_loss(&mut self, step: usize, loss: f32) {
        tracing::warn!(step, loss, "non-finite loss, skipping update");
    }

    fn checkpoint_saved(&mut self, step: usize, path: &Path) {
        tracing::info!(step, path = %path.display(), "taking snapshot");
    }

    fn sample_generated(&mut self, step: usize, frames: usize) {
        tracing::info!(step, frames, "generated sample video");
    }
}
