//! Cross-fold driver: builds the shared index once, runs every fold and
//! aggregates the per-fold best records.

use crate::data::frames::{DiskFrameSource, FrameSource, ResizeTransform};
use crate::data::index::{IndexOptions, LabelSource};
use crate::data::loader::{
    load_binary_lists, load_multilabel_table, load_regression_targets, load_split_lists,
    load_visit_metadata,
};
use crate::data::{
    AssemblerConfig, ClassBalancer, FoldSplit, PatientIndex, SampleAssembler, SplitPartitioner,
    TaskMode, VisitSubset,
};
use crate::error::{OctError, Result};
use crate::model::checkpoint::resolve_checkpoint;
use crate::model::ModelConfig;
use crate::training::callbacks::{CallbackManager, FoldRecorder, ProgressLoggerCallback, TimerCallback};
use crate::training::metrics::mean_std;
use crate::training::orchestrator::{FoldModel, FoldOrchestrator, FoldOutcome, FoldSchedule, FoldViews};
use crate::training::selection::{BestRecord, MetricTriple};
use crate::training::trainer::build_fold_model;
use crate::training::{FinetuneConfig, PatientDatasetType, SplitMode};
use crate::utils::ensure_dir;
use serde::Serialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Read whichever label table the task mode needs
pub fn load_label_source(config: &FinetuneConfig) -> Result<LabelSource> {
    let dir = &config.patient_id_list_dir;
    Ok(match config.task_mode {
        TaskMode::Regression => {
            LabelSource::Regression(load_regression_targets(dir.join(&config.regression_file))?)
        }
        mode if mode.is_multi_label() => {
            LabelSource::MultiLabel(load_multilabel_table(dir.join(&config.multilabel_file))?)
        }
        _ => LabelSource::Binary(load_binary_lists(dir, &config.disease)?),
    })
}

/// Load metadata and labels and build the visit index
pub fn build_index(config: &FinetuneConfig) -> Result<PatientIndex> {
    let metadata = load_visit_metadata(&config.metadata_file)?;
    let labels = load_label_source(config)?;
    let options = IndexOptions {
        task_mode: config.task_mode,
        multi_task_idx: config.multi_task_idx.clone(),
        layout: config.frame_layout(),
    };
    PatientIndex::build(&metadata, &labels, &options)
}

/// Assembler matching the configured sample layout
pub fn build_assembler(config: &FinetuneConfig, source: Arc<dyn FrameSource>) -> Result<SampleAssembler> {
    let volume = config.patient_dataset_type == PatientDatasetType::Volume3D;
    let assembler_config = AssemblerConfig {
        dataset_mode: config.dataset_mode,
        color: config.color_mode,
        downsample_width: config.downsample_width,
        pad_to_num_frames: if volume { config.padding_target() } else { None },
        same_3_frames: config.same_3_frames,
        return_both_res: config.variable_joint,
        high_res_num_frames: config.high_res_num_frames,
        ..AssemblerConfig::default()
    };

    let mut assembler = SampleAssembler::new(
        config.patient_dataset_type.frame_selection(),
        assembler_config,
        source,
    )?
    .with_transform(Arc::new(ResizeTransform {
        width: config.input_size,
        height: config.input_size,
    }));
    if config.variable_joint {
        assembler = assembler.with_high_res_transform(Arc::new(ResizeTransform {
            width: config.high_res_input_size,
            height: config.high_res_input_size,
        }));
    }
    Ok(assembler)
}

/// Folds for the configured split mode
pub fn partition(config: &FinetuneConfig, index: &PatientIndex) -> Result<Vec<FoldSplit>> {
    let partitioner = SplitPartitioner::new(index).with_few_shot(config.few_shot);
    match (config.split_mode, &config.split_path) {
        (SplitMode::SingleFold, Some(dir)) => Ok(vec![partitioner.single_fold(&load_split_lists(dir)?)?]),
        (SplitMode::SingleFold, None) => Err(OctError::config("single-fold runs need split_path")),
        (SplitMode::KFold, _) => partitioner.k_fold(config.k_folds, config.seed),
    }
}

/// Per-fold metric rows with their mean and population std
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricAggregate {
    pub rows: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl MetricAggregate {
    fn from_records<'a>(records: impl Iterator<Item = &'a BestRecord>, with_bal_acc: bool) -> Self {
        let rows: Vec<Vec<f64>> = records
            .map(|r| {
                let mut row = vec![r.auc, r.acc, r.auprc];
                if with_bal_acc {
                    row.push(r.bal_acc);
                }
                row
            })
            .collect();
        let width = rows.first().map_or(0, Vec::len);
        let (mean, std) = (0..width)
            .map(|col| {
                let column: Vec<f64> = rows.iter().map(|r| r[col]).collect();
                mean_std(&column)
            })
            .unzip();
        Self { rows, mean, std }
    }

    fn append_to(&self, path: &Path) -> Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", self)?;
        Ok(())
    }
}

fn format_row(values: &[f64]) -> String {
    let cells: Vec<String> = values.iter().map(|v| format!("{:.4}", v)).collect();
    format!("[{}]", cells.join(", "))
}

impl fmt::Display for MetricAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<String> = self.rows.iter().map(|r| format_row(r)).collect();
        writeln!(f, "Fold results: [{}]", rows.join(", "))?;
        writeln!(f, "Mean: {}", format_row(&self.mean))?;
        write!(f, "Std: {}", format_row(&self.std))
    }
}

/// Aggregated results of every fold of a run
#[derive(Debug, Clone, Serialize)]
pub struct CrossFoldSummary {
    pub outcomes: Vec<FoldOutcome>,
    pub best_val: MetricAggregate,
    pub best_test: MetricAggregate,
    pub test_at_best_val: MetricAggregate,
}

impl CrossFoldSummary {
    pub fn from_outcomes(outcomes: Vec<FoldOutcome>, task_mode: TaskMode) -> Self {
        let with_bal_acc = matches!(task_mode, TaskMode::BinaryCls | TaskMode::MultiCls | TaskMode::Regression);
        Self {
            best_val: MetricAggregate::from_records(outcomes.iter().map(|o| &o.best_val), with_bal_acc),
            best_test: MetricAggregate::from_records(outcomes.iter().map(|o| &o.best_test), with_bal_acc),
            test_at_best_val: MetricAggregate::from_records(
                outcomes.iter().map(|o| &o.test_at_best_val),
                with_bal_acc,
            ),
            outcomes,
        }
    }

    /// Append the aggregates to `fold_results*.txt` under `dir`
    pub fn write(&self, dir: &Path, split_mode: SplitMode) -> Result<()> {
        self.best_val.append_to(&dir.join("fold_results.txt"))?;
        self.best_test.append_to(&dir.join("fold_results_test.txt"))?;
        if split_mode == SplitMode::SingleFold {
            self.test_at_best_val
                .append_to(&dir.join("fold_results_test_for_best_val.txt"))?;
        }
        Ok(())
    }
}

/// Sizes reported by the `inspect` command
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub task_mode: TaskMode,
    pub num_patients: usize,
    pub num_visits: usize,
    pub normal_visits: usize,
    pub abnormal_visits: usize,
    pub classes: Vec<String>,
    /// `(tag, train patients, train visits, val visits, test visits)`
    pub folds: Vec<(String, usize, usize, usize, usize)>,
}

impl fmt::Display for InspectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Task mode: {}", self.task_mode)?;
        writeln!(f, "Classes: {:?}", self.classes)?;
        writeln!(
            f,
            "{} patients, {} visits ({} normal, {} abnormal)",
            self.num_patients, self.num_visits, self.normal_visits, self.abnormal_visits
        )?;
        for (tag, train_patients, train, val, test) in &self.folds {
            writeln!(
                f,
                "  {}: train {} visits ({} patients), val {}, test {}",
                tag, train, train_patients, val, test
            )?;
        }
        Ok(())
    }
}

/// Test-subset scores of one fold from an evaluation-only run
#[derive(Debug, Clone, Serialize)]
pub struct FoldEvaluation {
    pub tag: String,
    pub loss: Option<f64>,
    /// `None` when the fold's test subset could not be scored
    pub metrics: Option<MetricTriple>,
}

/// Index, assembler and folds shared by every fold of a run
pub struct PreparedRun {
    pub config: FinetuneConfig,
    pub index: Arc<PatientIndex>,
    pub assembler: Arc<SampleAssembler>,
    pub folds: Vec<FoldSplit>,
}

impl PreparedRun {
    /// Validate the configuration and build everything from disk
    pub fn prepare(config: FinetuneConfig) -> Result<Self> {
        config.validate()?;
        let index = build_index(&config)?;
        let source = Arc::new(DiskFrameSource::new(&config.data_path));
        Self::from_parts(config, index, source)
    }

    /// Build from an existing index and frame source
    pub fn from_parts(config: FinetuneConfig, index: PatientIndex, source: Arc<dyn FrameSource>) -> Result<Self> {
        let folds = partition(&config, &index)?;
        let assembler = build_assembler(&config, source)?;
        info!(
            "Indexed {} patients / {} visits into {} fold(s)",
            index.num_patients(),
            index.num_visits(),
            folds.len()
        );
        Ok(Self {
            config,
            index: Arc::new(index),
            assembler: Arc::new(assembler),
            folds,
        })
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::for_variant(
            self.config.model,
            self.assembler.channels(),
            self.index.num_outputs(),
        )
    }

    fn view(&self, indices: &[usize]) -> VisitSubset {
        VisitSubset::new(self.index.clone(), self.assembler.clone(), indices.to_vec())
    }

    fn balancer(&self) -> Result<Option<ClassBalancer>> {
        if !self.config.downsample_normal {
            return Ok(None);
        }
        ClassBalancer::new(
            self.config.seed,
            self.config.downsample_normal_factor,
            self.index.normal_visit_indices(),
            self.index.abnormal_visit_indices(),
        )
        .map(Some)
    }

    pub fn inspect(&self) -> InspectReport {
        InspectReport {
            task_mode: self.index.task_mode(),
            num_patients: self.index.num_patients(),
            num_visits: self.index.num_visits(),
            normal_visits: self.index.normal_visit_indices().len(),
            abnormal_visits: self.index.abnormal_visit_indices().len(),
            classes: self.index.idx_to_class().values().cloned().collect(),
            folds: self
                .folds
                .iter()
                .map(|f| (f.tag(), f.patients.train.len(), f.train.len(), f.val.len(), f.test.len()))
                .collect(),
        }
    }

    /// Run every fold with models from `factory` and write the aggregates
    pub fn run<M, F>(&self, mut factory: F) -> Result<CrossFoldSummary>
    where
        M: FoldModel,
        F: FnMut(&FoldSplit) -> Result<M>,
    {
        let output_dir = &self.config.output_dir;
        ensure_dir(output_dir)?;
        self.config.write_snapshot(output_dir)?;

        let mut outcomes = Vec::with_capacity(self.folds.len());
        for split in &self.folds {
            let views = FoldViews {
                train: self.view(&split.train),
                val: self.view(&split.val),
                test: self.view(&split.test),
            };
            let recorder = FoldRecorder::new(output_dir, &split.tag())?;

            let mut callbacks = CallbackManager::new();
            callbacks.add_callback(ProgressLoggerCallback::new(1));
            callbacks.add_callback(TimerCallback::new());

            let mut orchestrator = FoldOrchestrator::new(split, FoldSchedule::from(&self.config), views, recorder)
                .with_callbacks(callbacks);
            if let Some(balancer) = self.balancer()? {
                orchestrator = orchestrator.with_balancer(balancer);
            }

            let mut model = factory(split)?;
            outcomes.push(orchestrator.run(&mut model)?);
        }

        let summary = CrossFoldSummary::from_outcomes(outcomes, self.config.task_mode);
        info!("Best validation across folds:\n{}", summary.best_val);
        info!("Best test across folds:\n{}", summary.best_test);
        summary.write(output_dir, self.config.split_mode)?;
        Ok(summary)
    }

    /// Score each fold's test subset once without training.
    ///
    /// Predictions land in `test_<tag>.csv`; a fold whose test subset cannot
    /// be scored is noted and reported without metrics.
    pub fn evaluate<M, F>(&self, mut factory: F) -> Result<Vec<FoldEvaluation>>
    where
        M: FoldModel,
        F: FnMut(&FoldSplit) -> Result<M>,
    {
        let output_dir = &self.config.output_dir;
        ensure_dir(output_dir)?;

        let mut results = Vec::with_capacity(self.folds.len());
        for split in &self.folds {
            let tag = split.tag();
            let mode = format!("test_{}", tag);
            let recorder = FoldRecorder::new(output_dir, &tag)?;
            let mut model = factory(split)?;

            let result = match model.evaluate(&self.view(&split.test), &mode) {
                Ok(report) => {
                    recorder.write_predictions(&mode, &report.predictions)?;
                    let m = report.metrics;
                    recorder.note(&format!(
                        "Eval loss: {:.4}, AUC: {:.4}, ACC: {:.4}, AUPRC: {:.4}",
                        report.loss, m.auc, m.acc, m.auprc
                    ))?;
                    info!("[{}] test AUC {:.4} ACC {:.4} AUPRC {:.4}", tag, m.auc, m.acc, m.auprc);
                    FoldEvaluation { tag, loss: Some(report.loss), metrics: Some(m) }
                }
                Err(e) if e.is_fold_scoped() => {
                    warn!("[{}] evaluation skipped: {}", tag, e);
                    recorder.note(&format!("Eval skipped: {}", e))?;
                    FoldEvaluation { tag, loss: None, metrics: None }
                }
                Err(e) => return Err(e),
            };
            results.push(result);
        }

        std::fs::write(
            output_dir.join("eval_results.json"),
            serde_json::to_string_pretty(&results)?,
        )?;
        Ok(results)
    }
}

/// Full finetuning run on the default training backend.
///
/// With `resume` each fold continues from its latest checkpoint; otherwise
/// `finetune` only seeds the initial weights.
pub fn run_finetune(config: FinetuneConfig) -> Result<CrossFoldSummary> {
    let run = PreparedRun::prepare(config)?;
    let model_config = run.model_config();
    let device = <crate::TrainBackend as burn::tensor::backend::Backend>::Device::default();
    run.run(|split| {
        let mut model =
            build_fold_model::<crate::TrainBackend>(&run.config, model_config.clone(), split.fold, device.clone())?;
        if let Some(path) = &run.config.resume {
            model = model.resume_from(&resolve_checkpoint(path, &split.tag())?)?;
        } else if let Some(path) = &run.config.finetune {
            model.load_weights(&resolve_checkpoint(path, &split.tag())?)?;
        }
        Ok(model)
    })
}

/// Score every fold's test subset with the checkpoint under `resume`
pub fn run_evaluation(config: FinetuneConfig) -> Result<Vec<FoldEvaluation>> {
    let run = PreparedRun::prepare(config)?;
    let root = run
        .config
        .resume
        .clone()
        .ok_or_else(|| OctError::config("evaluation needs a checkpoint to resume from"))?;
    let model_config = run.model_config();
    let device = <crate::TrainBackend as burn::tensor::backend::Backend>::Device::default();
    run.evaluate(|split| {
        let mut model =
            build_fold_model::<crate::TrainBackend>(&run.config, model_config.clone(), split.fold, device.clone())?;
        model.load_weights(&resolve_checkpoint(&root, &split.tag())?)?;
        Ok(model)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frames::tests::SyntheticSource;
    use crate::data::loader::{BinaryLists, VisitMetadata};
    use crate::training::orchestrator::{EpochOutcome, EvalReport};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FixedModel {
        auprc: f64,
    }

    impl FoldModel for FixedModel {
        fn train_one_epoch(&mut self, _train: &VisitSubset, _epoch: usize) -> Result<EpochOutcome> {
            Ok(EpochOutcome::Completed { loss: 0.3, lr: 1e-3 })
        }

        fn evaluate(&mut self, _view: &VisitSubset, _mode: &str) -> Result<EvalReport> {
            self.auprc += 0.1;
            Ok(EvalReport {
                loss: 0.2,
                metrics: MetricTriple { auc: 0.6, acc: 0.6, auprc: self.auprc, bal_acc: Some(0.5) },
                predictions: Vec::new(),
            })
        }

        fn scale_learning_rate(&mut self, _factor: f64) {}

        fn save_checkpoint(&mut self, dir: &Path, epoch: usize) -> Result<PathBuf> {
            Ok(dir.join(format!("checkpoint-{}.mpk", epoch)))
        }
    }

    fn index() -> PatientIndex {
        let meta: VisitMetadata = (0..6)
            .map(|i| (format!("P{}", i), vec![format!("h{}", i)]))
            .collect();
        let lists = BinaryLists {
            disease: "AMD".into(),
            with_disease: vec!["P0".into(), "P1".into(), "P2".into()],
            without_disease: vec!["P3".into(), "P4".into(), "P5".into()],
        };
        PatientIndex::build(
            &meta,
            &LabelSource::Binary(lists),
            &IndexOptions::new(TaskMode::BinaryCls),
        )
        .unwrap()
    }

    #[test]
    fn test_kfold_run_writes_aggregates() {
        let dir = TempDir::new().unwrap();
        let config = FinetuneConfig {
            output_dir: dir.path().to_path_buf(),
            k_folds: 3,
            epochs: 2,
            ..FinetuneConfig::quick_test()
        };
        let run = PreparedRun::from_parts(config, index(), Arc::new(SyntheticSource::new(4, 4))).unwrap();
        assert_eq!(run.folds.len(), 3);

        let summary = run.run(|_| Ok(FixedModel { auprc: 0.0 })).unwrap();
        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.best_val.rows.len(), 3);
        assert_eq!(summary.best_val.mean.len(), 4);
        assert!(summary.best_val.std[0].abs() < 1e-12);

        assert!(dir.path().join("args.json").exists());
        assert!(dir.path().join("log_fold_2.txt").exists());
        let results = std::fs::read_to_string(dir.path().join("fold_results.txt")).unwrap();
        assert!(results.starts_with("Fold results:"));
        assert!(results.contains("Mean: [0.6000, 0.6000"));
        assert!(dir.path().join("fold_results_test.txt").exists());
        assert!(!dir.path().join("fold_results_test_for_best_val.txt").exists());
    }

    /// Scores test views only; degenerate for the fold it is built for
    struct TestOnlyModel {
        degenerate: bool,
    }

    impl FoldModel for TestOnlyModel {
        fn train_one_epoch(&mut self, _train: &VisitSubset, epoch: usize) -> Result<EpochOutcome> {
            panic!("evaluation trained at epoch {}", epoch);
        }

        fn evaluate(&mut self, view: &VisitSubset, mode: &str) -> Result<EvalReport> {
            assert!(mode.starts_with("test_"), "evaluated {}", mode);
            if self.degenerate {
                return Err(OctError::DegenerateEvaluation("single class".into()));
            }
            assert!(!view.is_empty());
            Ok(EvalReport {
                loss: 0.25,
                metrics: MetricTriple { auc: 0.8, acc: 0.75, auprc: 0.7, bal_acc: Some(0.75) },
                predictions: Vec::new(),
            })
        }

        fn scale_learning_rate(&mut self, _factor: f64) {}

        fn save_checkpoint(&mut self, _dir: &Path, _epoch: usize) -> Result<PathBuf> {
            Err(OctError::config("evaluation must not checkpoint"))
        }
    }

    #[test]
    fn test_evaluate_scores_test_views_only() {
        let dir = TempDir::new().unwrap();
        let config = FinetuneConfig {
            output_dir: dir.path().to_path_buf(),
            k_folds: 2,
            ..FinetuneConfig::quick_test()
        };
        let run = PreparedRun::from_parts(config, index(), Arc::new(SyntheticSource::new(4, 4))).unwrap();

        let results = run
            .evaluate(|split| {
                Ok(TestOnlyModel { degenerate: split.fold == Some(1) })
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tag, "fold_0");
        assert_eq!(results[0].loss, Some(0.25));
        assert_eq!(results[0].metrics.map(|m| m.auc), Some(0.8));
        assert!(results[1].metrics.is_none());

        let notes = std::fs::read_to_string(dir.path().join("auc_fold_0.txt")).unwrap();
        assert!(notes.contains("Eval loss: 0.2500, AUC: 0.8000"));
        let skipped = std::fs::read_to_string(dir.path().join("auc_fold_1.txt")).unwrap();
        assert!(skipped.contains("Eval skipped"));
        assert!(dir.path().join("eval_results.json").exists());
        assert!(!dir.path().join("fold_results.txt").exists());
    }

    #[test]
    fn test_inspect_report() {
        let dir = TempDir::new().unwrap();
        let config = FinetuneConfig {
            output_dir: dir.path().to_path_buf(),
            k_folds: 2,
            ..FinetuneConfig::quick_test()
        };
        let run = PreparedRun::from_parts(config, index(), Arc::new(SyntheticSource::new(4, 4))).unwrap();
        let report = run.inspect();
        assert_eq!(report.num_visits, 6);
        assert_eq!(report.normal_visits, 3);
        assert_eq!(report.folds.len(), 2);
        assert_eq!(report.classes, vec!["NC".to_string(), "AMD".to_string()]);
        assert!(report.to_string().contains("fold_1"));
    }

    #[test]
    fn test_model_config_follows_index() {
        let config = FinetuneConfig { k_folds: 2, ..FinetuneConfig::quick_test() };
        let run = PreparedRun::from_parts(config, index(), Arc::new(SyntheticSource::new(4, 4))).unwrap();
        let model_config = run.model_config();
        assert_eq!(model_config.num_outputs, 2);
        assert_eq!(model_config.in_channels, 3);
    }

    #[test]
    fn test_aggregate_display() {
        let records = [
            BestRecord { auc: 0.5, acc: 0.5, auprc: 0.5, bal_acc: 0.5, epoch: 0 },
            BestRecord { auc: 0.7, acc: 0.5, auprc: 0.9, bal_acc: 0.5, epoch: 3 },
        ];
        let agg = MetricAggregate::from_records(records.iter(), false);
        assert!((agg.mean[0] - 0.6).abs() < 1e-12);
        assert!((agg.mean[2] - 0.7).abs() < 1e-12);
        assert!((agg.std[2] - 0.2).abs() < 1e-12);
        assert!(agg.to_string().contains("Std: [0.1000, 0.0000, 0.2000]"));
    }
}
