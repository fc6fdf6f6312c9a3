//! Per-fold train / validate / test loop.
//!
//! A fold moves through `Init -> (TrainEpoch -> ValidateEpoch -> [TestEpoch])*
//! -> Terminate`. The orchestrator owns the best-metric state and the
//! resampled training indices; the model itself is reached only through the
//! [`FoldModel`] contract.

use crate::data::{ClassBalancer, FoldSplit, VisitSubset};
use crate::error::{OctError, Result};
use crate::training::callbacks::{CallbackManager, EpochSummary, FoldRecorder, TrainStats};
use crate::training::metrics::Prediction;
use crate::training::selection::{BestRecord, MetricTriple, SelectionState, ValMetric};
use crate::training::{FinetuneConfig, NonFinitePolicy};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Result of one training pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EpochOutcome {
    Completed { loss: f64, lr: f64 },
    /// The pass hit a NaN or infinite loss and was abandoned
    NonFinite { value: f64 },
}

/// Result of one evaluation pass
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub loss: f64,
    pub metrics: MetricTriple,
    pub predictions: Vec<Prediction>,
}

/// Model and optimizer as seen by the fold loop
pub trait FoldModel {
    /// One pass over `train`; `epoch` keys the schedule and the shuffle
    fn train_one_epoch(&mut self, train: &VisitSubset, epoch: usize) -> Result<EpochOutcome>;

    /// Score every visit of `view`. Undefined metrics surface as
    /// [`OctError::DegenerateEvaluation`].
    fn evaluate(&mut self, view: &VisitSubset, mode: &str) -> Result<EvalReport>;

    /// First epoch to run; non-zero when continuing from a checkpoint
    fn start_epoch(&self) -> usize {
        0
    }

    /// Multiply the learning rate of every parameter group
    fn scale_learning_rate(&mut self, factor: f64);

    fn save_checkpoint(&mut self, dir: &Path, epoch: usize) -> Result<PathBuf>;
}

/// Why a fold stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Termination {
    EpochsExhausted,
    EarlyStopped { epoch: usize },
    DegenerateEvaluation { epoch: usize, reason: String },
}

/// Everything a finished fold reports to the cross-fold driver
#[derive(Debug, Clone, Serialize)]
pub struct FoldOutcome {
    pub tag: String,
    pub fold: Option<usize>,
    pub best_val: BestRecord,
    pub best_test: BestRecord,
    pub test_at_best_val: BestRecord,
    pub termination: Termination,
    pub epochs_run: usize,
    pub lr_halvings: usize,
    pub checkpoints: Vec<PathBuf>,
    pub duration_secs: f64,
}

/// Loop settings taken from the run configuration
#[derive(Debug, Clone)]
pub struct FoldSchedule {
    pub epochs: usize,
    pub val_metric: ValMetric,
    pub early_stop_patience: Option<usize>,
    pub always_test: bool,
    /// Checkpoint stride over new-best epochs; `None` disables saving
    pub checkpoint_every: Option<usize>,
    pub non_finite_policy: NonFinitePolicy,
}

impl From<&FinetuneConfig> for FoldSchedule {
    fn from(config: &FinetuneConfig) -> Self {
        Self {
            epochs: config.epochs,
            val_metric: config.val_metric,
            early_stop_patience: config.enable_early_stop.then_some(config.early_stop_patience),
            always_test: config.always_test,
            checkpoint_every: config.save_model.then_some(config.save_model_every.max(1)),
            non_finite_policy: config.non_finite_policy,
        }
    }
}

/// Train, validation and test views of one fold
#[derive(Debug, Clone)]
pub struct FoldViews {
    pub train: VisitSubset,
    pub val: VisitSubset,
    pub test: VisitSubset,
}

/// Drives one fold to completion
pub struct FoldOrchestrator {
    tag: String,
    fold: Option<usize>,
    schedule: FoldSchedule,
    views: FoldViews,
    /// Training indices before any resampling
    train_base: Vec<usize>,
    balancer: Option<ClassBalancer>,
    recorder: FoldRecorder,
    callbacks: CallbackManager,
    state: SelectionState,
}

impl FoldOrchestrator {
    pub fn new(split: &FoldSplit, schedule: FoldSchedule, views: FoldViews, recorder: FoldRecorder) -> Self {
        let train_base = views.train.indices().to_vec();
        Self {
            tag: split.tag(),
            fold: split.fold,
            schedule,
            views,
            train_base,
            balancer: None,
            recorder,
            callbacks: CallbackManager::new(),
            state: SelectionState::default(),
        }
    }

    /// Resample the majority class every epoch; the training view is
    /// restricted to the current draw immediately.
    pub fn with_balancer(mut self, balancer: ClassBalancer) -> Self {
        self.views.train.update_indices(balancer.restrict(&self.train_base));
        self.balancer = Some(balancer);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackManager) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn views(&self) -> &FoldViews {
        &self.views
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.recorder.dir().join("checkpoints").join(&self.tag)
    }

    /// Record a recovered condition in the log and in the fold's text record
    fn surface(&self, message: &str) -> Result<()> {
        warn!("[{}] {}", self.tag, message);
        self.recorder.note(message)
    }

    pub fn run<M: FoldModel + ?Sized>(&mut self, model: &mut M) -> Result<FoldOutcome> {
        let start = Instant::now();
        let epochs = self.schedule.epochs;
        let metric = self.schedule.val_metric;
        let val_mode = format!("val_{}", self.tag);
        let test_mode = format!("test_{}", self.tag);

        info!(
            "[{}] {} train / {} val / {} test visits, {} epochs",
            self.tag,
            self.views.train.indices().len(),
            self.views.val.indices().len(),
            self.views.test.indices().len(),
            epochs
        );
        self.callbacks.on_fold_begin(&self.tag);

        let start_epoch = model.start_epoch().min(epochs);
        if start_epoch > 0 {
            info!("[{}] Starting at epoch {}", self.tag, start_epoch);
            if let Some(balancer) = self.balancer.as_mut() {
                balancer.seek_epoch(start_epoch as u64)?;
                let restricted = balancer.restrict(&self.train_base);
                self.views.train.update_indices(restricted);
            }
        }

        let mut termination = Termination::EpochsExhausted;
        let mut epochs_run = 0;
        let mut lr_halvings = 0;
        let mut checkpoints = Vec::new();

        for epoch in start_epoch..epochs {
            self.callbacks.on_epoch_begin(epoch);
            epochs_run = epoch + 1;

            let train = match model.train_one_epoch(&self.views.train, epoch)? {
                EpochOutcome::Completed { loss, lr } => TrainStats { loss, lr, abandoned: false },
                EpochOutcome::NonFinite { value } => match self.schedule.non_finite_policy {
                    NonFinitePolicy::Abort => {
                        return Err(OctError::NonFiniteLoss { epoch, value });
                    }
                    NonFinitePolicy::Recover => {
                        model.scale_learning_rate(0.5);
                        lr_halvings += 1;
                        self.surface(&format!(
                            "Loss is {} at epoch {}, downscale the learning rate by 2",
                            value, epoch
                        ))?;
                        TrainStats { loss: value, lr: f64::NAN, abandoned: true }
                    }
                },
            };

            let val = match model.evaluate(&self.views.val, &val_mode) {
                Ok(report) => report,
                Err(e) if e.is_fold_scoped() => {
                    self.surface(&format!("break at {}", epoch))?;
                    termination = Termination::DegenerateEvaluation { epoch, reason: e.to_string() };
                    break;
                }
                Err(e) => return Err(e),
            };
            self.recorder.write_predictions(&val_mode, &val.predictions)?;

            let is_best = self.state.observe_val(metric, &val.metrics, epoch);
            if is_best {
                let best = self.state.best_val;
                self.recorder.note(&best_line(&best))?;
                self.callbacks.on_new_best(&best);

                if let Some(every) = self.schedule.checkpoint_every {
                    if (epoch + 1) % every == 0 {
                        let path = model.save_checkpoint(&self.checkpoint_dir(), epoch)?;
                        info!("[{}] Saved checkpoint {}", self.tag, path.display());
                        checkpoints.push(path);
                    }
                }
            }

            let mut test_metrics = None;
            if is_best || epoch + 1 == epochs || self.schedule.always_test {
                match model.evaluate(&self.views.test, &test_mode) {
                    Ok(report) => {
                        self.recorder.write_predictions(&test_mode, &report.predictions)?;
                        if self.state.observe_test(metric, &report.metrics, epoch) {
                            self.recorder.note_test(&best_line(&self.state.best_test))?;
                        }
                        test_metrics = Some(report.metrics);
                    }
                    Err(e) if e.is_fold_scoped() => {
                        self.surface(&format!("break at {} during test", epoch))?;
                        termination = Termination::DegenerateEvaluation { epoch, reason: e.to_string() };
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            let summary = EpochSummary {
                epoch,
                train,
                val: val.metrics,
                val_loss: val.loss,
                test: test_metrics,
                is_best,
                best_val: self.state.best_val,
            };
            self.recorder.log_epoch(&summary)?;
            self.callbacks.on_epoch_end(&summary);

            if !is_best {
                if let Some(patience) = self.schedule.early_stop_patience {
                    if self.state.register_stale_epoch(patience) {
                        self.surface(&format!("Early stop at epoch {}", epoch))?;
                        termination = Termination::EarlyStopped { epoch };
                        break;
                    }
                }
            }

            if let Some(balancer) = self.balancer.as_mut() {
                balancer.advance_epoch()?;
                let restricted = balancer.restrict(&self.train_base);
                self.views.train.update_indices(restricted);
            }
        }

        let duration_secs = start.elapsed().as_secs_f64();
        self.recorder.write_time(duration_secs)?;

        let outcome = FoldOutcome {
            tag: self.tag.clone(),
            fold: self.fold,
            best_val: self.state.best_val,
            best_test: self.state.best_test,
            test_at_best_val: self.state.test_at_best_val,
            termination,
            epochs_run,
            lr_halvings,
            checkpoints,
            duration_secs,
        };
        self.callbacks.on_fold_end(&outcome);
        Ok(outcome)
    }
}

fn best_line(record: &BestRecord) -> String {
    format!(
        "Max AUC: {:.4}, Max ACC: {:.4}, Max AUPRC: {:.4}, Max Bal Acc: {:.4}, at epoch {}",
        record.auc, record.acc, record.auprc, record.bal_acc, record.epoch
    )
}
