use crate::data::dataset::BatchTargets;
use crate::data::{ReplicaShard, TaskMode, VisitBatcher, VisitItem, VisitSubset};
use crate::error::{OctError, Result};
use crate::model::architecture::{init_model, VolumeClassifier};
use crate::model::checkpoint::{CheckpointManager, CheckpointMetadata};
use crate::model::ModelConfig;
use crate::training::metrics::{evaluate_predictions, Prediction};
use crate::training::orchestrator::{EpochOutcome, EvalReport, FoldModel};
use crate::training::scheduler::{LearningRateScheduler, ParamGroups};
use crate::training::selection::MetricTriple;
use crate::training::FinetuneConfig;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::nn::loss::{BinaryCrossEntropyLossConfig, CrossEntropyLossConfig, MseLoss, Reduction};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Parameter groups, from the input side to the output layer
const PARAM_GROUPS: [&str; 2] = ["backbone", "head"];

/// Loss of one batch for whichever target layout it carries
fn batch_loss<B: Backend>(logits: Tensor<B, 2>, targets: BatchTargets<B>) -> Tensor<B, 1> {
    let device = logits.device();
    match targets {
        BatchTargets::Classes(t) => CrossEntropyLossConfig::new().init(&device).forward(logits, t),
        BatchTargets::MultiHot(t) => BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device)
            .forward(logits, t),
        BatchTargets::Values(t) => MseLoss::new().forward(logits, t, Reduction::Mean),
    }
}

/// Probabilities (or raw values for regression) from logits
fn output_scores<B: Backend>(task_mode: TaskMode, logits: Tensor<B, 2>) -> Tensor<B, 2> {
    match task_mode {
        TaskMode::Regression => logits,
        mode if mode.is_multi_label() => sigmoid(logits),
        _ => softmax(logits, 1),
    }
}

fn tensor_values<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| OctError::Serialization(format!("failed to read tensor data: {:?}", e)))
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

/// Burn implementation of the fold model contract
pub struct BurnFoldModel<B: AutodiffBackend, O> {
    model: VolumeClassifier<B>,
    optim: O,
    model_config: ModelConfig,
    task_mode: TaskMode,
    scheduler: LearningRateScheduler,
    groups: ParamGroups,
    batch_size: usize,
    shard: ReplicaShard,
    device: B::Device,
    fold: Option<usize>,
    /// Metrics of the latest validation pass, stored with checkpoints
    last_val: Option<MetricTriple>,
    show_progress: bool,
    start_epoch: usize,
}

/// AdamW-backed fold model configured from a run configuration
pub fn build_fold_model<B: AutodiffBackend>(
    config: &FinetuneConfig,
    model_config: ModelConfig,
    fold: Option<usize>,
    device: B::Device,
) -> Result<BurnFoldModel<B, impl Optimizer<VolumeClassifier<B>, B>>> {
    let optim = AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .init::<B, VolumeClassifier<B>>();
    let lr = config.effective_lr();
    let scheduler = LearningRateScheduler::warmup_cosine(lr, config.min_lr, config.warmup_epochs, config.epochs);
    let shard = ReplicaShard::new(config.world_size, 0, config.seed, true)?;

    info!(
        "Model {} ({} outputs), base lr {:.3e}, layer decay {}",
        model_config.variant, model_config.num_outputs, lr, config.layer_decay
    );
    Ok(BurnFoldModel {
        model: init_model::<B>(&model_config, &device),
        optim,
        model_config,
        task_mode: config.task_mode,
        scheduler,
        groups: ParamGroups::layer_decayed(&PARAM_GROUPS, config.layer_decay),
        batch_size: config.batch_size,
        shard,
        device,
        fold,
        last_val: None,
        show_progress: true,
        start_epoch: 0,
    })
}

impl<B: AutodiffBackend, O: Optimizer<VolumeClassifier<B>, B>> BurnFoldModel<B, O> {
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn model(&self) -> &VolumeClassifier<B> {
        &self.model
    }

    pub fn param_groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// Replace the weights with a saved classifier of the same layout
    pub fn load_weights(&mut self, checkpoint: &Path) -> Result<CheckpointMetadata> {
        let dir = checkpoint
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let (model, metadata) = CheckpointManager::open(dir)?.load_checkpoint::<B>(checkpoint, &self.device)?;

        let saved = &metadata.model_config;
        if saved.variant != self.model_config.variant
            || saved.in_channels != self.model_config.in_channels
            || saved.num_outputs != self.model_config.num_outputs
        {
            return Err(OctError::config(format!(
                "checkpoint {:?} holds {} ({} channels, {} outputs), run expects {} ({} channels, {} outputs)",
                checkpoint,
                saved.variant,
                saved.in_channels,
                saved.num_outputs,
                self.model_config.variant,
                self.model_config.in_channels,
                self.model_config.num_outputs
            )));
        }
        self.model = model;
        self.last_val = metadata.val_metrics;
        info!("Loaded weights from {:?} (epoch {})", checkpoint, metadata.epoch);
        Ok(metadata)
    }

    /// Load a checkpoint and continue with the epoch after it
    pub fn resume_from(mut self, checkpoint: &Path) -> Result<Self> {
        let metadata = self.load_weights(checkpoint)?;
        self.start_epoch = metadata.epoch + 1;
        info!("Resuming at epoch {}", self.start_epoch);
        Ok(self)
    }

    /// One optimizer step with per-group learning rates
    fn step(&mut self, loss: Tensor<B, 1>) {
        let mut grads = loss.backward();
        let backbone = GradientsParams::from_module(&mut grads, &self.model.hidden);
        let head = GradientsParams::from_module(&mut grads, &self.model.head);

        let model = self.model.clone();
        let model = self.optim.step(self.groups.lr_of("backbone"), model, backbone);
        self.model = self.optim.step(self.groups.lr_of("head"), model, head);
    }
}

impl<B: AutodiffBackend, O: Optimizer<VolumeClassifier<B>, B>> FoldModel for BurnFoldModel<B, O> {
    fn train_one_epoch(&mut self, train: &VisitSubset, epoch: usize) -> Result<EpochOutcome> {
        let batcher = VisitBatcher::<B>::new(self.device.clone());
        let positions = self.shard.positions(train.len(), epoch);
        let steps = positions.len() / self.batch_size;
        if steps == 0 {
            warn!(
                "Epoch {}: {} training visits do not fill one batch of {}",
                epoch,
                positions.len(),
                self.batch_size
            );
            return Ok(EpochOutcome::Completed { loss: 0.0, lr: self.groups.lr_of("head") });
        }

        let bar = progress_bar(steps as u64, self.show_progress);
        bar.set_message(format!("epoch {}", epoch));
        let mut total_loss = 0.0;
        let mut done = 0usize;

        for (step, chunk) in positions.chunks_exact(self.batch_size).enumerate() {
            let fractional_epoch = epoch as f64 + step as f64 / steps as f64;
            self.groups.adjust(self.scheduler.get_lr(fractional_epoch));

            let items = chunk
                .iter()
                .map(|&p| train.item(p))
                .collect::<Result<Vec<VisitItem>>>()?;
            let batch = batcher.batch(items);
            let logits = self.model.forward(batch.volumes, batch.high_res);
            let loss = batch_loss(logits, batch.targets);

            let value: f64 = loss.clone().into_scalar().elem();
            if !value.is_finite() {
                bar.abandon_with_message(format!("loss is {}", value));
                warn!("Loss is {} at epoch {} step {}, stopping training", value, epoch, step);
                return Ok(EpochOutcome::NonFinite { value });
            }

            self.step(loss);
            total_loss += value;
            done += 1;
            bar.inc(1);
            bar.set_message(format!("epoch {} loss {:.4}", epoch, value));
        }
        bar.finish_and_clear();

        let loss = total_loss / done.max(1) as f64;
        debug!("Epoch {} train loss {:.4} over {} steps", epoch, loss, done);
        Ok(EpochOutcome::Completed { loss, lr: self.groups.lr_of("head") })
    }

    fn evaluate(&mut self, view: &VisitSubset, mode: &str) -> Result<EvalReport> {
        let model = self.model.valid();
        let batcher = VisitBatcher::<B::InnerBackend>::new(self.device.clone());
        let positions: Vec<usize> = (0..view.len()).collect();

        let mut predictions = Vec::with_capacity(positions.len());
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for chunk in positions.chunks(self.batch_size) {
            let items = chunk
                .iter()
                .map(|&p| view.item(p))
                .collect::<Result<Vec<VisitItem>>>()?;
            let batch = batcher.batch(items);
            let logits = model.forward(batch.volumes, batch.high_res);
            let width = logits.dims()[1];

            let loss: f64 = batch_loss(logits.clone(), batch.targets).into_scalar().elem();
            loss_sum += loss;
            batches += 1;

            let scores = tensor_values(output_scores(self.task_mode, logits))?;
            for (row, (visit_index, label)) in batch.visit_indices.into_iter().zip(batch.labels).enumerate() {
                predictions.push(Prediction {
                    visit_index,
                    label,
                    scores: scores[row * width..(row + 1) * width].to_vec(),
                });
            }
        }

        let metrics = evaluate_predictions(self.task_mode, &predictions)?;
        if mode.starts_with("val") {
            self.last_val = Some(metrics);
        }
        let loss = loss_sum / batches.max(1) as f64;
        debug!(
            "{}: loss {:.4}, auc {:.4}, acc {:.4}, auprc {:.4}",
            mode, loss, metrics.auc, metrics.acc, metrics.auprc
        );
        Ok(EvalReport { loss, metrics, predictions })
    }

    fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    fn scale_learning_rate(&mut self, factor: f64) {
        self.groups.scale(factor);
        for group in self.groups.iter() {
            info!("Learning rate of {} is now {:.3e}", group.name, group.lr);
        }
    }

    fn save_checkpoint(&mut self, dir: &Path, epoch: usize) -> Result<PathBuf> {
        let manager = CheckpointManager::new(dir)?;
        let metadata = CheckpointMetadata::new(
            epoch,
            self.fold,
            self.last_val,
            self.model_config.clone(),
            self.scheduler.base_lr(),
        );
        manager.save_checkpoint(&self.model, &metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frames::tests::SyntheticSource;
    use crate::data::frames::{AssemblerConfig, DiskFrameSource, FrameSelection, SampleAssembler};
    use crate::data::index::{IndexOptions, LabelSource};
    use crate::data::loader::{BinaryLists, FrameLayout, VisitMetadata};
    use crate::data::PatientIndex;
    use crate::model::ModelVariant;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use std::sync::Arc;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn subset() -> VisitSubset {
        let meta: VisitMetadata = [
            ("A", vec!["a1", "a2"]),
            ("B", vec!["b1", "b2"]),
        ]
        .into_iter()
        .map(|(p, v)| (p.to_string(), v.into_iter().map(String::from).collect()))
        .collect();
        let lists = BinaryLists {
            disease: "AMD".into(),
            with_disease: vec!["A".into()],
            without_disease: vec!["B".into()],
        };
        let mut options = IndexOptions::new(TaskMode::BinaryCls);
        options.layout = FrameLayout { num_frames: 3, ..FrameLayout::default() };
        let index = Arc::new(PatientIndex::build(&meta, &LabelSource::Binary(lists), &options).unwrap());
        let assembler = Arc::new(
            SampleAssembler::new(
                FrameSelection::AllFrames,
                AssemblerConfig::default(),
                Arc::new(SyntheticSource::new(4, 4)),
            )
            .unwrap(),
        );
        VisitSubset::new(index, assembler, vec![0, 1, 2, 3])
    }

    fn fold_model(config: &FinetuneConfig) -> BurnFoldModel<TestBackend, impl Optimizer<VolumeClassifier<TestBackend>, TestBackend>> {
        let model_config = ModelConfig::for_variant(ModelVariant::PooledMlp3d, 3, 2);
        build_fold_model::<TestBackend>(config, model_config, Some(0), Default::default())
            .unwrap()
            .with_progress(false)
    }

    fn config() -> FinetuneConfig {
        FinetuneConfig { lr: Some(1e-2), warmup_epochs: 0, ..FinetuneConfig::quick_test() }
    }

    #[test]
    fn test_train_one_epoch() {
        let config = config();
        let mut model = fold_model(&config);
        match model.train_one_epoch(&subset(), 0).unwrap() {
            EpochOutcome::Completed { loss, lr } => {
                assert!(loss.is_finite());
                assert!(lr > 0.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_evaluate_scores_every_visit() {
        let config = config();
        let mut model = fold_model(&config);
        let report = model.evaluate(&subset(), "val_fold_0").unwrap();

        assert_eq!(report.predictions.len(), 4);
        for p in &report.predictions {
            assert_eq!(p.scores.len(), 2);
            assert!((p.scores.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        assert!(report.metrics.auc >= 0.0 && report.metrics.auc <= 1.0);
        assert!(model.last_val.is_some());
    }

    #[test]
    fn test_single_class_view_is_degenerate() {
        let config = config();
        let mut model = fold_model(&config);
        let mut view = subset();
        view.update_indices(vec![0, 1]);
        let err = model.evaluate(&view, "test_fold_0").unwrap_err();
        assert!(err.is_fold_scoped());
    }

    #[test]
    fn test_missing_frames_fail_evaluation() {
        let dir = tempfile::TempDir::new().unwrap();
        let healthy = subset();
        let assembler = Arc::new(
            SampleAssembler::new(
                FrameSelection::AllFrames,
                AssemblerConfig::default(),
                Arc::new(DiskFrameSource::new(dir.path())),
            )
            .unwrap(),
        );
        let view = VisitSubset::new(
            Arc::new(healthy.patient_index().clone()),
            assembler,
            healthy.indices().to_vec(),
        );

        let config = config();
        let mut model = fold_model(&config);
        let err = model.evaluate(&view, "val_fold_0").unwrap_err();
        assert!(matches!(err, OctError::Io(_)));
        assert!(!err.is_fold_scoped());
        assert!(model.last_val.is_none());

        let err = model.train_one_epoch(&view, 0).unwrap_err();
        assert!(matches!(err, OctError::Io(_)));
    }

    #[test]
    fn test_scale_learning_rate_persists() {
        let config = config();
        let mut model = fold_model(&config);
        model.train_one_epoch(&subset(), 0).unwrap();
        model.scale_learning_rate(0.5);
        let head = model.param_groups().get("head").unwrap();
        assert_eq!(head.recovery_scale, 0.5);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config();
        let mut trained = fold_model(&config);
        trained.train_one_epoch(&subset(), 0).unwrap();
        trained.evaluate(&subset(), "val_fold_0").unwrap();
        let path = trained.save_checkpoint(dir.path(), 3).unwrap();

        let resumed = fold_model(&config).resume_from(&path).unwrap();
        assert_eq!(resumed.start_epoch(), 4);
        assert_eq!(resumed.last_val, trained.last_val);

        let fresh = fold_model(&config);
        let data = |m: &BurnFoldModel<TestBackend, _>| {
            m.model().head.weight.val().into_data().to_vec::<f32>().unwrap()
        };
        assert_eq!(data(&resumed), data(&trained));
        assert_ne!(data(&fresh), data(&trained));
    }

    #[test]
    fn test_load_weights_rejects_other_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config();
        let path = fold_model(&config).save_checkpoint(dir.path(), 0).unwrap();

        let model_config = ModelConfig::for_variant(ModelVariant::PooledMlp3d, 3, 5);
        let mut other = build_fold_model::<TestBackend>(&config, model_config, Some(0), Default::default()).unwrap();
        assert!(matches!(other.load_weights(&path), Err(OctError::Configuration(_))));
    }

    #[test]
    fn test_save_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config();
        let mut model = fold_model(&config);
        let path = model.save_checkpoint(dir.path(), 4).unwrap();
        assert!(path.ends_with("checkpoint-4.mpk"));
        assert!(path.with_extension("json").exists());
    }
}
