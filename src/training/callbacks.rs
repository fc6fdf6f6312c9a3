use crate::error::Result;
use crate::training::metrics::Prediction;
use crate::training::orchestrator::FoldOutcome;
use crate::training::selection::{BestRecord, MetricTriple};
use crate::utils::{ensure_dir, format_duration};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Training statistics of one epoch
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrainStats {
    pub loss: f64,
    pub lr: f64,
    /// Epoch abandoned after a non-finite loss
    pub abandoned: bool,
}

/// Everything observed during one epoch of a fold
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: TrainStats,
    pub val: MetricTriple,
    pub val_loss: f64,
    pub test: Option<MetricTriple>,
    pub is_best: bool,
    pub best_val: BestRecord,
}

/// Fold lifecycle hooks
///
/// Callbacks observe the orchestrator without influencing it.
pub trait FoldCallback: Send {
    fn on_fold_begin(&mut self, _tag: &str) {}

    fn on_epoch_begin(&mut self, _epoch: usize) {}

    fn on_epoch_end(&mut self, _summary: &EpochSummary) {}

    fn on_new_best(&mut self, _record: &BestRecord) {}

    fn on_fold_end(&mut self, _outcome: &FoldOutcome) {}
}

/// Fans events out to every registered callback
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn FoldCallback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback<C: FoldCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn on_fold_begin(&mut self, tag: &str) {
        for callback in &mut self.callbacks {
            callback.on_fold_begin(tag);
        }
    }

    pub fn on_epoch_begin(&mut self, epoch: usize) {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch);
        }
    }

    pub fn on_epoch_end(&mut self, summary: &EpochSummary) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(summary);
        }
    }

    pub fn on_new_best(&mut self, record: &BestRecord) {
        for callback in &mut self.callbacks {
            callback.on_new_best(record);
        }
    }

    pub fn on_fold_end(&mut self, outcome: &FoldOutcome) {
        for callback in &mut self.callbacks {
            callback.on_fold_end(outcome);
        }
    }
}

/// Logs epoch results through `tracing`
pub struct ProgressLoggerCallback {
    log_frequency: usize,
}

impl ProgressLoggerCallback {
    pub fn new(log_frequency: usize) -> Self {
        Self { log_frequency: log_frequency.max(1) }
    }
}

impl FoldCallback for ProgressLoggerCallback {
    fn on_fold_begin(&mut self, tag: &str) {
        tracing::info!("Starting {}", tag);
    }

    fn on_epoch_end(&mut self, s: &EpochSummary) {
        if (s.epoch + 1) % self.log_frequency == 0 || s.is_best {
            tracing::info!(
                "Epoch {} - train loss {:.4}, lr {:.2e}, val auc {:.4}, acc {:.4}, auprc {:.4}{}",
                s.epoch,
                s.train.loss,
                s.train.lr,
                s.val.auc,
                s.val.acc,
                s.val.auprc,
                if s.is_best { " (best)" } else { "" }
            );
        }
    }

    fn on_new_best(&mut self, record: &BestRecord) {
        tracing::debug!("New best {}", record);
    }

    fn on_fold_end(&mut self, outcome: &FoldOutcome) {
        tracing::info!(
            "Finished {} after {} epochs ({:?}); best val {}",
            outcome.tag,
            outcome.epochs_run,
            outcome.termination,
            outcome.best_val
        );
    }
}

/// Tracks wall-clock time per epoch
#[derive(Default)]
pub struct TimerCallback {
    start_time: Option<Instant>,
    epoch_start: Option<Instant>,
    epoch_times: Vec<Duration>,
}

impl TimerCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn average_epoch_time(&self) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            None
        } else {
            let total: Duration = self.epoch_times.iter().sum();
            Some(total / self.epoch_times.len() as u32)
        }
    }
}

impl FoldCallback for TimerCallback {
    fn on_fold_begin(&mut self, _tag: &str) {
        self.start_time = Some(Instant::now());
        self.epoch_times.clear();
    }

    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.epoch_start = Some(Instant::now());
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        if let Some(start) = self.epoch_start.take() {
            let elapsed = start.elapsed();
            tracing::debug!("Epoch {} took {:.2?}", summary.epoch, elapsed);
            self.epoch_times.push(elapsed);
        }
    }

    fn on_fold_end(&mut self, outcome: &FoldOutcome) {
        if let (Some(start), Some(avg)) = (self.start_time, self.average_epoch_time()) {
            tracing::info!(
                "{} took {} ({:.2?} per epoch)",
                outcome.tag,
                format_duration(start.elapsed().as_secs_f64()),
                avg
            );
        }
    }
}

/// Persisted per-fold text records and prediction files
#[derive(Debug, Clone)]
pub struct FoldRecorder {
    dir: PathBuf,
    tag: String,
    single_fold: bool,
}

impl FoldRecorder {
    /// `tag` is `fold_<k>` or `singlefold`
    pub fn new<P: AsRef<Path>>(dir: P, tag: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        ensure_dir(&dir)?;
        Ok(Self {
            dir,
            tag: tag.to_string(),
            single_fold: tag == "singlefold",
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(&self, file: &str, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        if self.single_fold {
            self.dir.join("log.txt")
        } else {
            self.dir.join(format!("log_{}.txt", self.tag))
        }
    }

    pub fn notes_path(&self) -> PathBuf {
        self.dir.join(format!("auc_{}.txt", self.tag))
    }

    /// One JSON line per epoch
    pub fn log_epoch(&self, summary: &EpochSummary) -> Result<()> {
        let line = serde_json::to_string(summary)?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Human-readable line in `auc_<tag>.txt`
    pub fn note(&self, line: &str) -> Result<()> {
        self.append(&format!("auc_{}.txt", self.tag), line)
    }

    /// Human-readable line in `auc_test_<tag>.txt`
    pub fn note_test(&self, line: &str) -> Result<()> {
        self.append(&format!("auc_test_{}.txt", self.tag), line)
    }

    pub fn write_time(&self, secs: f64) -> Result<()> {
        let file = if self.single_fold {
            "time.txt".to_string()
        } else {
            format!("time_{}.txt", self.tag)
        };
        self.append(&file, &format!("Training time {:.3}s ({})", secs, format_duration(secs)))
    }

    /// `<mode>.csv` with one row per visit
    pub fn write_predictions(&self, mode: &str, predictions: &[Prediction]) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.csv", mode));
        let mut writer = csv::Writer::from_path(&path)?;

        let label_width = predictions.first().map_or(1, |p| p.label.width());
        let score_width = predictions.first().map_or(0, |p| p.scores.len());
        let mut header = vec!["visit_index".to_string()];
        header.extend((0..label_width).map(|i| format!("label_{}", i)));
        header.extend((0..score_width).map(|i| format!("score_{}", i)));
        writer.write_record(&header)?;

        for p in predictions {
            let mut row = vec![p.visit_index.to_string()];
            row.extend(p.label.to_values().iter().map(|v| v.to_string()));
            row.extend(p.scores.iter().map(|s| format!("{:.6}", s)));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(path)
    }
}
