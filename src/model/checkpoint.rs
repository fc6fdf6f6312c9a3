use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{OctError, Result};
use crate::model::architecture::{init_model, VolumeClassifier};
use crate::model::ModelConfig;
use crate::training::selection::MetricTriple;

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Sidecar metadata written next to each checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: String,
    pub epoch: usize,
    pub fold: Option<usize>,
    /// Validation metrics that made this epoch a new best, if any were seen
    pub val_metrics: Option<MetricTriple>,
    pub model_config: ModelConfig,
    /// Base learning rate at save time
    pub learning_rate: f64,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        fold: Option<usize>,
        val_metrics: Option<MetricTriple>,
        model_config: ModelConfig,
        learning_rate: f64,
    ) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            epoch,
            fold,
            val_metrics,
            model_config,
            learning_rate,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn recorder_error(context: &str, err: impl std::fmt::Display) -> OctError {
    OctError::Serialization(format!("{}: {}", context, err))
}

/// Saves and restores classifier weights under one output directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self { checkpoint_dir })
    }

    /// Open an existing checkpoint directory for reading
    pub fn open<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        if !checkpoint_dir.is_dir() {
            return Err(OctError::config(format!(
                "checkpoint directory {:?} does not exist",
                checkpoint_dir
            )));
        }
        Ok(Self { checkpoint_dir })
    }

    /// Write `checkpoint-<epoch>.mpk` plus a `.json` sidecar
    pub fn save_checkpoint<B: Backend>(
        &self,
        model: &VolumeClassifier<B>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let checkpoint_path = self
            .checkpoint_dir
            .join(format!("{}{}.mpk", CHECKPOINT_PREFIX, metadata.epoch));

        CompactRecorder::new()
            .record(model.clone().into_record(), checkpoint_path.clone())
            .map_err(|e| recorder_error("failed to save checkpoint", e))?;

        let metadata_json = serde_json::to_string_pretty(metadata)?;
        fs::write(checkpoint_path.with_extension("json"), metadata_json)?;

        info!("Saved checkpoint: {:?}", checkpoint_path);
        Ok(checkpoint_path)
    }

    /// Rebuild a classifier from a checkpoint and its sidecar
    pub fn load_checkpoint<B: Backend>(
        &self,
        checkpoint_path: &Path,
        device: &B::Device,
    ) -> Result<(VolumeClassifier<B>, CheckpointMetadata)> {
        info!("Loading checkpoint from {:?}", checkpoint_path);

        let metadata_json = fs::read_to_string(checkpoint_path.with_extension("json"))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)?;

        let record = CompactRecorder::new()
            .load(checkpoint_path.to_path_buf(), device)
            .map_err(|e| recorder_error("failed to load checkpoint", e))?;
        let model = init_model::<B>(&metadata.model_config, device).load_record(record);

        debug!("Checkpoint epoch {}, fold {:?}", metadata.epoch, metadata.fold);
        Ok((model, metadata))
    }

    /// `(epoch, path)` for every checkpoint in the directory
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "mpk").unwrap_or(false) {
                let epoch = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix(CHECKPOINT_PREFIX))
                    .and_then(|s| s.parse::<usize>().ok());
                if let Some(epoch) = epoch {
                    checkpoints.push((epoch, path));
                }
            }
        }
        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints)
    }

    /// Most recent checkpoint, if any
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop().map(|(_, path)| path))
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

/// Checkpoint a fold should start from.
///
/// `path` is either a checkpoint file, used as is, or a checkpoint root; in a
/// root the latest checkpoint of `<root>/<tag>/` wins, falling back to the
/// root itself when it has no per-fold directory.
pub fn resolve_checkpoint(path: &Path, tag: &str) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    let fold_dir = path.join(tag);
    let dir = if fold_dir.is_dir() { fold_dir } else { path.to_path_buf() };
    CheckpointManager::open(&dir)?
        .latest()?
        .ok_or_else(|| OctError::config(format!("no checkpoint for {} under {:?}", tag, dir)))
}
