use crate::data::{ColorMode, TaskMode};
use crate::error::Result;
use crate::model::ModelVariant;
use crate::training::{FinetuneConfig, NonFinitePolicy, PatientDatasetType, SplitMode, ValMetric};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// OCTCube: patient-centric OCT finetuning pipeline
#[derive(Parser, Debug)]
#[command(name = "octcube")]
#[command(about = "Patient-centric OCT dataset indexing and fold finetuning")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Finetune across folds
    Finetune(FinetuneArgs),

    /// Build the index and folds and print their sizes
    Inspect(InspectArgs),
}

/// Dataset, label and split options shared by every command.
///
/// Every value is optional and overrides the JSON config or the defaults.
#[derive(Args, Debug, Default)]
pub struct DataArgs {
    /// JSON configuration file; missing fields take their defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Task mode (binary_cls, multi_label, multi_task, multi_task_default, regression)
    #[arg(long)]
    pub task_mode: Option<TaskMode>,

    /// Disease for binary tasks
    #[arg(long)]
    pub disease: Option<String>,

    /// Finding positions kept for multi-task modes
    #[arg(long, value_delimiter = ',')]
    pub multi_task_idx: Option<Vec<usize>>,

    /// Dataset root holding frame images
    #[arg(short, long)]
    pub data_path: Option<PathBuf>,

    /// Patient -> visit metadata (.json or .json.gz)
    #[arg(long)]
    pub metadata_file: Option<PathBuf>,

    /// Directory with patient lists and label tables
    #[arg(long)]
    pub patient_id_list_dir: Option<PathBuf>,

    /// Output directory for logs, predictions and checkpoints
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Number of folds
    #[arg(short, long)]
    pub k_folds: Option<usize>,

    /// Use the curated train/val/test lists in this directory instead of k-fold
    #[arg(long)]
    pub single_fold: Option<PathBuf>,

    /// Swap train and val after splitting
    #[arg(long)]
    pub few_shot: bool,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,
}

impl DataArgs {
    /// Defaults, then the JSON file, then these overrides
    pub fn base_config(&self) -> Result<FinetuneConfig> {
        let mut config = match &self.config {
            Some(path) => FinetuneConfig::from_json_file(path)?,
            None => FinetuneConfig::default(),
        };
        self.apply_to(&mut config);
        Ok(config)
    }

    pub fn apply_to(&self, config: &mut FinetuneConfig) {
        if let Some(v) = self.task_mode {
            config.task_mode = v;
        }
        if let Some(v) = &self.disease {
            config.disease = v.clone();
        }
        if let Some(v) = &self.multi_task_idx {
            config.multi_task_idx = Some(v.clone());
        }
        if let Some(v) = &self.data_path {
            config.data_path = v.clone();
        }
        if let Some(v) = &self.metadata_file {
            config.metadata_file = v.clone();
        }
        if let Some(v) = &self.patient_id_list_dir {
            config.patient_id_list_dir = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = self.k_folds {
            config.k_folds = v;
        }
        if let Some(v) = &self.single_fold {
            config.split_mode = SplitMode::SingleFold;
            config.split_path = Some(v.clone());
        }
        if self.few_shot {
            config.few_shot = true;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

/// Finetuning arguments
#[derive(Args, Debug, Default)]
pub struct FinetuneArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Absolute learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Base learning rate: lr = blr * total batch size / 256
    #[arg(long)]
    pub blr: Option<f64>,

    /// Lower bound of the cosine schedule
    #[arg(long)]
    pub min_lr: Option<f64>,

    #[arg(long)]
    pub warmup_epochs: Option<usize>,

    /// Layer-wise learning rate decay
    #[arg(long)]
    pub layer_decay: Option<f64>,

    #[arg(long)]
    pub weight_decay: Option<f64>,

    /// Replica count for sharding the training subset
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Downsample normal visits every epoch
    #[arg(long)]
    pub downsample_normal: bool,

    #[arg(long)]
    pub downsample_normal_factor: Option<usize>,

    /// Validation metric (AUC or AUPRC)
    #[arg(long)]
    pub val_metric: Option<ValMetric>,

    #[arg(long)]
    pub enable_early_stop: bool,

    #[arg(long)]
    pub early_stop_patience: Option<usize>,

    /// Run the test pass after every epoch
    #[arg(long)]
    pub always_test: bool,

    /// Save checkpoints on new-best epochs
    #[arg(long)]
    pub save_model: bool,

    #[arg(long)]
    pub save_model_every: Option<usize>,

    /// Fail instead of halving the learning rate on a non-finite loss
    #[arg(long)]
    pub abort_on_non_finite: bool,

    /// Model variant
    #[arg(short, long)]
    pub model: Option<ModelVariant>,

    /// Patient dataset type (Center2D or 3D)
    #[arg(long)]
    pub patient_dataset_type: Option<PatientDatasetType>,

    /// Color mode (rgb or gray)
    #[arg(long)]
    pub color_mode: Option<ColorMode>,

    /// Frame resize target
    #[arg(long)]
    pub input_size: Option<u32>,

    /// Pad or crop volumes to this many frames
    #[arg(long)]
    pub num_frames: Option<usize>,

    /// Keep the original frame count
    #[arg(long)]
    pub no_padding: bool,

    /// Repeat the middle frame three times
    #[arg(long)]
    pub same_3_frames: bool,

    /// Emit a second high-resolution stream
    #[arg(long)]
    pub variable_joint: bool,

    #[arg(long)]
    pub high_res_input_size: Option<u32>,

    #[arg(long)]
    pub high_res_num_frames: Option<usize>,

    /// Initialize weights from a checkpoint file or checkpoint root
    #[arg(long, value_name = "PATH")]
    pub finetune: Option<PathBuf>,

    /// Continue each fold from its latest checkpoint under PATH
    #[arg(long, value_name = "PATH")]
    pub resume: Option<PathBuf>,

    /// Only score the test subsets with the --resume weights
    #[arg(long, requires = "resume")]
    pub eval: bool,

    /// Quick test mode (tiny inputs, few epochs)
    #[arg(long)]
    pub quick: bool,
}

impl FinetuneArgs {
    /// Resolve the effective configuration
    pub fn resolve(&self) -> Result<FinetuneConfig> {
        let mut config = if self.quick && self.data.config.is_none() {
            FinetuneConfig::quick_test()
        } else {
            self.data.base_config()?
        };
        self.data.apply_to(&mut config);
        self.apply_to(&mut config);
        Ok(config)
    }

    pub fn apply_to(&self, config: &mut FinetuneConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        set!(
            epochs,
            batch_size,
            blr,
            min_lr,
            warmup_epochs,
            layer_decay,
            weight_decay,
            world_size,
            downsample_normal_factor,
            val_metric,
            early_stop_patience,
            save_model_every,
            model,
            patient_dataset_type,
            color_mode,
            input_size,
            num_frames,
            high_res_input_size
        );
        if self.lr.is_some() {
            config.lr = self.lr;
        }
        if self.high_res_num_frames.is_some() {
            config.high_res_num_frames = self.high_res_num_frames;
        }
        if self.finetune.is_some() {
            config.finetune = self.finetune.clone();
        }
        if self.resume.is_some() {
            config.resume = self.resume.clone();
        }
        if self.eval {
            config.eval = true;
        }
        if self.downsample_normal {
            config.downsample_normal = true;
        }
        if self.enable_early_stop {
            config.enable_early_stop = true;
        }
        if self.always_test {
            config.always_test = true;
        }
        if self.save_model {
            config.save_model = true;
        }
        if self.abort_on_non_finite {
            config.non_finite_policy = NonFinitePolicy::Abort;
        }
        if self.no_padding {
            config.pad_to_num_frames = false;
        }
        if self.same_3_frames {
            config.same_3_frames = true;
        }
        if self.variable_joint {
            config.variable_joint = true;
        }
    }
}

/// Inspection arguments
#[derive(Args, Debug, Default)]
pub struct InspectArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
