//! Checkpoint persistence
//!
//! A checkpoint is a directory holding the denoiser record, the optimizer
//! record and a JSON metadata file:
//!
//! ```text
//! flowdiff_B0010_S000400/
//!   denoiser.mpk
//!   optimizer.mpk
//!   meta.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::config::{DenoiserConfig, DiffusionConfig, FlowRepresentation, TrainingObjective};
use crate::diffusion::FlowDiffusion;
use crate::error::{FlowDiffusionError, Result};

const MODEL_FILE: &str = "denoiser";
const OPTIMIZER_FILE: &str = "optimizer";
const META_FILE: &str = "meta.json";

/// Training position, run layout and architecture stored next to the records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Examples consumed by all completed steps; never decreases within a run
    pub examples_processed: usize,
    /// Number of completed optimization steps
    pub step: usize,
    pub objective: TrainingObjective,
    pub representation: FlowRepresentation,
    /// Denoiser the record was written from
    pub denoiser: DenoiserConfig,
    /// Diffusion process the denoiser was trained under
    pub diffusion: DiffusionConfig,
}

impl CheckpointMeta {
    /// Step a resumed run starts at: ceil(examples_processed / batch_size).
    pub fn resume_step(&self, batch_size: usize) -> usize {
        self.examples_processed.div_ceil(batch_size.max(1))
    }

    /// Metadata for `model` at the given training position.
    pub fn describe<B: Backend>(
        model: &FlowDiffusion<B>,
        step: usize,
        examples_processed: usize,
        objective: TrainingObjective,
        representation: FlowRepresentation,
    ) -> Self {
        Self {
            examples_processed,
            step,
            objective,
            representation,
            denoiser: model.denoiser().config().clone(),
            diffusion: model.config().clone(),
        }
    }

    fn check_layout(
        &self,
        objective: TrainingObjective,
        representation: FlowRepresentation,
    ) -> Result<()> {
        if self.objective != objective || self.representation != representation {
            return Err(FlowDiffusionError::config(format!(
                "checkpoint was trained with {:?}/{:?}, run is configured for {:?}/{:?}",
                self.objective, self.representation, objective, representation
            )));
        }
        Ok(())
    }

    /// Records only load into a model built from the same configs.
    fn check_architecture(
        &self,
        denoiser: &DenoiserConfig,
        diffusion: &DiffusionConfig,
    ) -> Result<()> {
        if serde_json::to_value(&self.denoiser)? != serde_json::to_value(denoiser)? {
            return Err(FlowDiffusionError::config(format!(
                "checkpoint denoiser {:?} does not match model denoiser {:?}",
                self.denoiser, denoiser
            )));
        }
        if serde_json::to_value(&self.diffusion)? != serde_json::to_value(diffusion)? {
            return Err(FlowDiffusionError::config(format!(
                "checkpoint diffusion {:?} does not match model diffusion {:?}",
                self.diffusion, diffusion
            )));
        }
        Ok(())
    }
}

/// Where a checkpoint lands inside the snapshot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    /// Step-tagged snapshot, kept
    Step { batch_size: usize, step: usize },
    /// Overwritten on every update
    Latest,
}

impl CheckpointTag {
    pub fn dir_in(&self, snapshot_dir: impl AsRef<Path>) -> PathBuf {
        let name = match self {
            Self::Step { batch_size, step } => format!("flowdiff_B{batch_size:04}_S{step:06}"),
            Self::Latest => "flowdiff".to_string(),
        };
        snapshot_dir.as_ref().join(name)
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::new()
}

/// Checkpoint bundle operations
pub struct Checkpoint;

impl Checkpoint {
    /// Write model, optimizer state and metadata into `dir`, creating it if needed.
    pub fn save<B, O>(
        dir: impl AsRef<Path>,
        model: &FlowDiffusion<B>,
        optim: &O,
        meta: &CheckpointMeta,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<FlowDiffusion<B>, B>,
    {
        let dir = dir.as_ref();
        Self::save_model(dir, model, meta)?;
        recorder().record(optim.to_record(), dir.join(OPTIMIZER_FILE))?;
        Ok(())
    }

    /// Write model and metadata only, for inference-side exports.
    pub fn save_model<B: Backend>(
        dir: impl AsRef<Path>,
        model: &FlowDiffusion<B>,
        meta: &CheckpointMeta,
    ) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        recorder().record(model.clone().into_record(), dir.join(MODEL_FILE))?;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;

        tracing::info!(
            path = %dir.display(),
            step = meta.step,
            examples = meta.examples_processed,
            "saved checkpoint"
        );
        Ok(())
    }

    /// Read only the metadata of a checkpoint.
    pub fn meta(dir: impl AsRef<Path>) -> Result<CheckpointMeta> {
        let path = dir.as_ref().join(META_FILE);
        if !path.is_file() {
            return Err(FlowDiffusionError::Checkpoint(format!(
                "no checkpoint metadata at {}",
                path.display()
            )));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Restore model and optimizer state for resuming a run.
    ///
    /// Rejects checkpoints written under a different objective, flow
    /// representation or architecture.
    pub fn load<B, O>(
        dir: impl AsRef<Path>,
        model: FlowDiffusion<B>,
        optim: O,
        objective: TrainingObjective,
        representation: FlowRepresentation,
        device: &B::Device,
    ) -> Result<(FlowDiffusion<B>, O, CheckpointMeta)>
    where
        B: AutodiffBackend,
        O: Optimizer<FlowDiffusion<B>, B>,
    {
        let dir = dir.as_ref();
        let (model, meta) = Self::load_model(dir, model, device)?;
        meta.check_layout(objective, representation)?;

        let record = recorder().load(dir.join(OPTIMIZER_FILE), device)?;
        Ok((model, optim.load_record(record), meta))
    }

    /// Restore the denoiser alone, on any backend.
    ///
    /// `model` must be built from the configs stored in the metadata.
    pub fn load_model<B: Backend>(
        dir: impl AsRef<Path>,
        model: FlowDiffusion<B>,
        device: &B::Device,
    ) -> Result<(FlowDiffusion<B>, CheckpointMeta)> {
        let dir = dir.as_ref();
        let meta = Self::meta(dir)?;
        meta.check_architecture(model.denoiser().config(), model.config())?;
        let record = recorder().load(dir.join(MODEL_FILE), device)?;

        tracing::info!(path = %dir.display(), step = meta.step, "loaded checkpoint");
        Ok((model.load_record(record), meta))
    }
}
