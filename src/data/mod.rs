pub mod balance;
pub mod dataset;
pub mod frames;
pub mod index;
pub mod loader;
pub mod split;

use crate::error::{OctError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use balance::ClassBalancer;
pub use dataset::{ReplicaShard, VisitBatch, VisitBatcher, VisitItem, VisitSubset};
pub use frames::{AssemblerConfig, FrameSelection, SampleAssembler};
pub use index::PatientIndex;
pub use split::{FoldSplit, PatientSplit, SplitPartitioner};

/// Diseases with curated binary patient lists
pub const AVAILABLE_DISEASES: &[&str] = &["AMD", "DME", "POG", "ODR", "PM", "CRO", "RN", "VD"];

/// Number of B-scans in a macular OCT volume
pub const DEFAULT_OCT_FRAMES: usize = 61;

/// Class name used for the negative class of binary tasks
pub const NORMAL_CLASS_NAME: &str = "NC";

/// Label structure governing how disease status is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    BinaryCls,
    MultiCls,
    MultiLabel,
    MultiTask,
    MultiTaskDefault,
    Regression,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::BinaryCls => "binary_cls",
            TaskMode::MultiCls => "multi_cls",
            TaskMode::MultiLabel => "multi_label",
            TaskMode::MultiTask => "multi_task",
            TaskMode::MultiTaskDefault => "multi_task_default",
            TaskMode::Regression => "regression",
        }
    }

    /// Multi-label and both multi-task flavours share one label table layout
    pub fn is_multi_label(&self) -> bool {
        matches!(
            self,
            TaskMode::MultiLabel | TaskMode::MultiTask | TaskMode::MultiTaskDefault
        )
    }

    /// Whether normal visits can be downsampled for this mode
    pub fn supports_balancing(&self) -> bool {
        matches!(self, TaskMode::BinaryCls) || self.is_multi_label()
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskMode {
    type Err = OctError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary_cls" => Ok(TaskMode::BinaryCls),
            "multi_cls" => Ok(TaskMode::MultiCls),
            "multi_label" => Ok(TaskMode::MultiLabel),
            "multi_task" => Ok(TaskMode::MultiTask),
            "multi_task_default" => Ok(TaskMode::MultiTaskDefault),
            "regression" => Ok(TaskMode::Regression),
            other => Err(OctError::UnsupportedTaskMode(other.to_string())),
        }
    }
}

/// How a visit is turned into a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    /// Per-visit sample (center frame, or the padded volume for 3D)
    Frame,
    /// Every frame of the visit, stacked without padding
    FrameInferenceAll,
}

impl FromStr for DatasetMode {
    type Err = OctError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "frame" => Ok(DatasetMode::Frame),
            "frame_inference_all" => Ok(DatasetMode::FrameInferenceAll),
            other => Err(OctError::UnsupportedDatasetMode(other.to_string())),
        }
    }
}

/// Pixel layout frames are converted to after loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Rgb,
    Gray,
}

impl ColorMode {
    pub fn channels(&self) -> usize {
        match self {
            ColorMode::Rgb => 3,
            ColorMode::Gray => 1,
        }
    }
}

impl FromStr for ColorMode {
    type Err = OctError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rgb" => Ok(ColorMode::Rgb),
            "gray" => Ok(ColorMode::Gray),
            other => Err(OctError::config(format!("unknown color mode '{}'", other))),
        }
    }
}

/// Label attached to a visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Label {
    /// Class index for binary/multi-class tasks
    Class(usize),
    /// Per-finding indicator vector; position 0 is the normal indicator
    MultiHot(Vec<f32>),
    /// Continuous target
    Value(f32),
}

impl Label {
    /// Width of the label when laid out in a target tensor
    pub fn width(&self) -> usize {
        match self {
            Label::MultiHot(v) => v.len(),
            Label::Class(_) | Label::Value(_) => 1,
        }
    }

    /// Flat numeric view used for CSV output
    pub fn to_values(&self) -> Vec<f32> {
        match self {
            Label::Class(c) => vec![*c as f32],
            Label::MultiHot(v) => v.clone(),
            Label::Value(v) => vec![*v],
        }
    }
}

/// One clinical imaging encounter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    /// Dense visit index, stable for the lifetime of the index
    pub index: usize,
    /// Owning patient
    pub patient_id: String,
    /// Visit hash from the metadata
    pub visit_hash: String,
    /// Frame paths relative to the dataset root, in acquisition order
    pub frames: Vec<PathBuf>,
    /// Visit label
    pub label: Label,
}

impl Visit {
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}

/// A patient and its visits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    /// Visit indices in metadata order
    pub visit_indices: Vec<usize>,
    /// Patient-level label (after any multi-task projection)
    pub label: Label,
    /// Whether the patient counts as majority ("normal") for balancing
    pub is_normal: bool,
}
