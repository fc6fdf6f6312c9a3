//! # OCTCube: patient-centric OCT finetuning pipeline
//!
//! Indexes retinal OCT visits per patient, partitions patients into
//! leakage-free folds, rebalances the majority class per epoch and drives
//! validation-selected finetuning of volume classifiers.
//!
//! ## Features
//!
//! - Patient/visit index over binary, multi-label, multi-task and regression labels
//! - Patient-grouped k-fold and curated single-fold splits (with few-shot swap)
//! - Reproducible per-epoch majority-class downsampling
//! - Center-frame and full-volume sample assembly with padding and dual resolution
//! - Fold orchestration with cascade model selection, early stopping and
//!   non-finite loss recovery
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use octcube::training::runner::{run_finetune, PreparedRun};
//! use octcube::training::FinetuneConfig;
//!
//! let config = FinetuneConfig {
//!     data_path: "data/".into(),
//!     metadata_file: "data/patient_visits.json.gz".into(),
//!     patient_id_list_dir: "multi_cls_expr_10x/".into(),
//!     k_folds: 5,
//!     ..FinetuneConfig::default()
//! };
//!
//! // Index and partition only
//! let run = PreparedRun::prepare(config.clone()).unwrap();
//! println!("{}", run.inspect());
//!
//! // Train every fold
//! let summary = run_finetune(config).unwrap();
//! println!("{}", summary.best_val);
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Backend used for finetuning
pub type TrainBackend = burn::backend::Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::{ClassBalancer, FoldSplit, PatientIndex, SampleAssembler, SplitPartitioner, TaskMode};
pub use error::{OctError, Result};
pub use model::{architecture::VolumeClassifier, ModelConfig, ModelVariant};
pub use training::{FinetuneConfig, FoldModel, FoldOrchestrator, FoldOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - patient-centric OCT finetuning pipeline",
        NAME, VERSION
    )
}
