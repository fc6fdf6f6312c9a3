pub mod callbacks;
pub mod metrics;
pub mod orchestrator;
pub mod runner;
pub mod scheduler;
pub mod selection;
pub mod trainer;

use crate::data::loader::{FrameLayout, Modality};
use crate::data::{ColorMode, DatasetMode, FrameSelection, TaskMode, AVAILABLE_DISEASES, DEFAULT_OCT_FRAMES};
use crate::error::{OctError, Result};
use crate::model::ModelVariant;
use crate::utils::validation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use orchestrator::{FoldModel, FoldOrchestrator, FoldOutcome};
pub use selection::{BestRecord, MetricTriple, ValMetric};

/// What happens when a training step yields a NaN or infinite loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Fail the run (pretraining behaviour)
    Abort,
    /// Abandon the epoch and halve every learning rate
    #[default]
    Recover,
}

/// How patients are partitioned into folds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    #[default]
    KFold,
    SingleFold,
}

/// Sample layout requested for the patient dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PatientDatasetType {
    #[serde(rename = "Center2D")]
    Center2D,
    #[default]
    #[serde(rename = "3D")]
    Volume3D,
}

impl PatientDatasetType {
    pub fn frame_selection(&self) -> FrameSelection {
        match self {
            PatientDatasetType::Center2D => FrameSelection::CenterFrame,
            PatientDatasetType::Volume3D => FrameSelection::AllFrames,
        }
    }
}

impl FromStr for PatientDatasetType {
    type Err = OctError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Center2D" => Ok(PatientDatasetType::Center2D),
            "3D" => Ok(PatientDatasetType::Volume3D),
            other => Err(OctError::config(format!(
                "patient dataset type must be Center2D or 3D, got '{}'",
                other
            ))),
        }
    }
}

/// Finetuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// Label structure
    pub task_mode: TaskMode,
    /// Disease for binary tasks
    pub disease: String,
    /// Finding positions kept for multi-task modes
    pub multi_task_idx: Option<Vec<usize>>,

    /// Dataset root holding frame images
    pub data_path: PathBuf,
    /// Patient -> visit hash metadata (`.json` or `.json.gz`)
    pub metadata_file: PathBuf,
    /// Directory with per-disease lists and the multi-label table
    pub patient_id_list_dir: PathBuf,
    pub multilabel_file: String,
    pub regression_file: String,
    pub modality: Modality,
    pub oct_frames: usize,
    pub output_dir: PathBuf,

    pub split_mode: SplitMode,
    pub k_folds: usize,
    /// Directory with `{train,val,test}_pat_list.txt` for single-fold runs
    pub split_path: Option<PathBuf>,
    pub few_shot: bool,

    pub downsample_normal: bool,
    pub downsample_normal_factor: usize,

    pub val_metric: ValMetric,
    pub enable_early_stop: bool,
    pub early_stop_patience: usize,
    pub always_test: bool,
    pub save_model: bool,
    pub save_model_every: usize,

    pub epochs: usize,
    pub batch_size: usize,
    /// Absolute learning rate; derived from `blr` when unset
    pub lr: Option<f64>,
    pub blr: f64,
    pub min_lr: f64,
    pub warmup_epochs: usize,
    pub layer_decay: f64,
    pub weight_decay: f64,
    pub seed: u64,
    /// Replica count for sharding the training subset
    pub world_size: usize,
    pub non_finite_policy: NonFinitePolicy,
    /// Initial weights: a checkpoint file, or a checkpoint root with one
    /// directory per fold tag
    pub finetune: Option<PathBuf>,
    /// Continue from a checkpoint (same layout as `finetune`), restarting at
    /// the epoch after the saved one
    pub resume: Option<PathBuf>,
    /// Score the test subsets with the `resume` weights and stop
    pub eval: bool,

    pub model: ModelVariant,
    pub patient_dataset_type: PatientDatasetType,
    pub dataset_mode: DatasetMode,
    pub color_mode: ColorMode,
    pub downsample_width: bool,
    pub input_size: u32,
    pub pad_to_num_frames: bool,
    pub num_frames: usize,
    pub same_3_frames: bool,
    /// Emit a second, high-resolution stream
    pub variable_joint: bool,
    pub high_res_input_size: u32,
    pub high_res_num_frames: Option<usize>,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            task_mode: TaskMode::BinaryCls,
            disease: "AMD".to_string(),
            multi_task_idx: None,
            data_path: PathBuf::from("data"),
            metadata_file: PathBuf::from("data/patient_visits.json"),
            patient_id_list_dir: PathBuf::from("multi_cls_expr_10x"),
            multilabel_file: "multilabel_cls_dict.json".to_string(),
            regression_file: "regression_targets.json".to_string(),
            modality: Modality::Oct,
            oct_frames: DEFAULT_OCT_FRAMES,
            output_dir: PathBuf::from("outputs"),
            split_mode: SplitMode::KFold,
            k_folds: 5,
            split_path: None,
            few_shot: false,
            downsample_normal: false,
            downsample_normal_factor: 10,
            val_metric: ValMetric::Auprc,
            enable_early_stop: false,
            early_stop_patience: 10,
            always_test: false,
            save_model: false,
            save_model_every: 1,
            epochs: 100,
            batch_size: 8,
            lr: None,
            blr: 5e-3,
            min_lr: 1e-6,
            warmup_epochs: 10,
            layer_decay: 0.75,
            weight_decay: 0.05,
            seed: 0,
            world_size: 1,
            non_finite_policy: NonFinitePolicy::Recover,
            finetune: None,
            resume: None,
            eval: false,
            model: ModelVariant::PooledProbe3d,
            patient_dataset_type: PatientDatasetType::Volume3D,
            dataset_mode: DatasetMode::Frame,
            color_mode: ColorMode::Rgb,
            downsample_width: true,
            input_size: 256,
            pad_to_num_frames: true,
            num_frames: 60,
            same_3_frames: false,
            variable_joint: false,
            high_res_input_size: 512,
            high_res_num_frames: None,
        }
    }
}

impl FinetuneConfig {
    /// Configuration for quick local runs
    pub fn quick_test() -> Self {
        Self {
            epochs: 3,
            batch_size: 2,
            k_folds: 2,
            input_size: 32,
            num_frames: 8,
            warmup_epochs: 1,
            ..Default::default()
        }
    }

    /// Read a JSON configuration; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the effective configuration as `args.json`
    pub fn write_snapshot<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let path = dir.as_ref().join("args.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// `lr` if given, otherwise `blr * batch_size * world_size / 256`
    pub fn effective_lr(&self) -> f64 {
        self.lr
            .unwrap_or(self.blr * (self.batch_size * self.world_size) as f64 / 256.0)
    }

    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout {
            modality: self.modality,
            num_frames: self.oct_frames,
            ..FrameLayout::default()
        }
    }

    /// Target frame count for padding/cropping, if enabled
    pub fn padding_target(&self) -> Option<usize> {
        self.pad_to_num_frames.then_some(self.num_frames)
    }

    /// Check every option combination before any data is touched
    pub fn validate(&self) -> Result<()> {
        validation::positive(self.epochs, "epochs")?;
        validation::positive(self.batch_size, "batch_size")?;
        validation::positive(self.world_size, "world_size")?;
        validation::positive(self.save_model_every, "save_model_every")?;
        validation::in_range(self.layer_decay, f64::MIN_POSITIVE, 1.0, "layer_decay")?;

        if self.task_mode == TaskMode::MultiCls {
            return Err(OctError::UnsupportedTaskMode(
                "multi_cls cannot be indexed".to_string(),
            ));
        }
        if self.task_mode == TaskMode::BinaryCls && !AVAILABLE_DISEASES.contains(&self.disease.as_str()) {
            return Err(OctError::config(format!(
                "unknown disease '{}', expected one of {:?}",
                self.disease, AVAILABLE_DISEASES
            )));
        }
        if self.multi_task_idx.is_some()
            && !matches!(self.task_mode, TaskMode::MultiTask | TaskMode::MultiTaskDefault)
        {
            return Err(OctError::config("multi_task_idx requires a multi_task mode"));
        }

        if self.downsample_normal {
            validation::positive(self.downsample_normal_factor, "downsample_normal_factor")?;
            if !self.task_mode.supports_balancing() {
                return Err(OctError::config(format!(
                    "downsampling normal visits is not defined for {}",
                    self.task_mode
                )));
            }
        }

        match self.split_mode {
            SplitMode::KFold if self.k_folds < 2 => {
                return Err(OctError::config(format!("k_folds must be >= 2, got {}", self.k_folds)));
            }
            SplitMode::SingleFold if self.split_path.is_none() => {
                return Err(OctError::config("single-fold runs need split_path"));
            }
            _ => {}
        }

        if self.same_3_frames && (!self.pad_to_num_frames || self.num_frames != 3) {
            return Err(OctError::config(
                "same_3_frames requires pad_to_num_frames with num_frames == 3",
            ));
        }
        if self.model.frame_selection() != self.patient_dataset_type.frame_selection() {
            return Err(OctError::config(format!(
                "model {} does not accept {:?} samples",
                self.model, self.patient_dataset_type
            )));
        }
        if self.variable_joint && self.patient_dataset_type != PatientDatasetType::Volume3D {
            return Err(OctError::config("variable_joint requires 3D samples"));
        }
        if self.eval && self.resume.is_none() {
            return Err(OctError::config("eval needs a checkpoint to resume from"));
        }
        Ok(())
    }
}
