//! Burn dataset view over a subset of visits, plus batching and sharding.

use crate::data::frames::{Sample, SampleAssembler, Volume};
use crate::data::{Label, PatientIndex};
use crate::error::{OctError, Result};
use crate::utils::random::seeded_rng;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, warn};

/// One assembled visit ready for batching
#[derive(Debug, Clone)]
pub struct VisitItem {
    pub visit_index: usize,
    pub volume: Volume,
    pub high_res: Option<Volume>,
    pub label: Label,
}

impl VisitItem {
    fn from_sample(visit_index: usize, sample: Sample) -> Result<Self> {
        match sample {
            Sample::Center(c) => {
                let label = c.label().clone();
                let volume = Volume::stack(vec![c.frame().clone()])?;
                Ok(Self { visit_index, volume, high_res: None, label })
            }
            Sample::Volume(v) => Ok(Self {
                visit_index,
                volume: v.volume,
                high_res: v.high_res,
                label: v.label,
            }),
        }
    }

    /// `(frames, channels, height, width)`, channels kept even when squeezed
    fn dims(&self) -> [usize; 4] {
        let v = &self.volume;
        [v.num_frames, v.channels, v.height, v.width]
    }
}

/// Ordered list of visit indices drawn from a shared [`PatientIndex`]
#[derive(Clone, Debug)]
pub struct VisitSubset {
    index: Arc<PatientIndex>,
    assembler: Arc<SampleAssembler>,
    indices: Vec<usize>,
}

impl VisitSubset {
    pub fn new(index: Arc<PatientIndex>, assembler: Arc<SampleAssembler>, indices: Vec<usize>) -> Self {
        Self { index, assembler, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn patient_index(&self) -> &PatientIndex {
        &self.index
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Replace the visible visits in place
    pub fn update_indices(&mut self, indices: Vec<usize>) {
        debug!("Subset indices updated: {} -> {}", self.indices.len(), indices.len());
        self.indices = indices;
    }

    /// Labels in subset order, without loading any frames
    pub fn labels(&self) -> Vec<Label> {
        self.indices
            .iter()
            .filter_map(|&v| self.index.visit(v).map(|visit| visit.label.clone()))
            .collect()
    }

    /// Assemble the item at a subset position
    pub fn item(&self, position: usize) -> Result<VisitItem> {
        let visit_index = *self.indices.get(position).ok_or_else(|| {
            OctError::MetadataInconsistency(format!("subset position {} out of range", position))
        })?;
        let visit = self.index.visit(visit_index).ok_or_else(|| {
            OctError::MetadataInconsistency(format!("visit {} is not indexed", visit_index))
        })?;
        let sample = self.assembler.assemble(visit)?;
        VisitItem::from_sample(visit_index, sample)
    }
}

impl Dataset<VisitItem> for VisitSubset {
    fn get(&self, index: usize) -> Option<VisitItem> {
        match self.item(index) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping subset position {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Distributes a subset across replicas.
///
/// Every replica sees `ceil(N / replicas)` positions; the shuffled order is
/// padded by wrap-around to `num_samples * replicas` and replica `r` takes
/// positions `r, r + replicas, ...`.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaShard {
    pub num_replicas: usize,
    pub rank: usize,
    pub seed: u64,
    pub shuffle: bool,
}

impl ReplicaShard {
    pub fn new(num_replicas: usize, rank: usize, seed: u64, shuffle: bool) -> Result<Self> {
        if num_replicas == 0 || rank >= num_replicas {
            return Err(OctError::config(format!(
                "invalid replica rank {} of {}",
                rank, num_replicas
            )));
        }
        Ok(Self { num_replicas, rank, seed, shuffle })
    }

    /// Single-process shard
    pub fn single(seed: u64, shuffle: bool) -> Self {
        Self { num_replicas: 1, rank: 0, seed, shuffle }
    }

    pub fn num_samples(&self, len: usize) -> usize {
        len.div_ceil(self.num_replicas)
    }

    pub fn total_size(&self, len: usize) -> usize {
        self.num_samples(len) * self.num_replicas
    }

    /// Subset positions this replica visits in `epoch`
    pub fn positions(&self, len: usize, epoch: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = seeded_rng(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.total_size(len);
        let mut i = 0;
        while order.len() < total {
            order.push(order[i % len]);
            i += 1;
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

/// Targets laid out for the loss of each task family
#[derive(Clone, Debug)]
pub enum BatchTargets<B: Backend> {
    /// `[batch]` class indices
    Classes(Tensor<B, 1, Int>),
    /// `[batch, findings]` 0/1 indicators
    MultiHot(Tensor<B, 2, Int>),
    /// `[batch, 1]` continuous targets
    Values(Tensor<B, 2>),
}

#[derive(Clone, Debug)]
pub struct VisitBatch<B: Backend> {
    /// `[batch, frames, channels, height, width]`
    pub volumes: Tensor<B, 5>,
    pub high_res: Option<Tensor<B, 5>>,
    pub targets: BatchTargets<B>,
    pub labels: Vec<Label>,
    pub visit_indices: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct VisitBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VisitBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn stack_volumes<'a>(&self, volumes: impl Iterator<Item = &'a Volume>, dims: [usize; 4], batch: usize) -> Tensor<B, 5> {
        let data: Vec<f32> = volumes.flat_map(|v| v.data.iter().copied()).collect();
        Tensor::<B, 5>::from_floats(
            TensorData::new(data, [batch, dims[0], dims[1], dims[2], dims[3]]),
            &self.device,
        )
    }

    fn targets(&self, labels: &[Label]) -> BatchTargets<B> {
        let n = labels.len();
        match labels.first() {
            Some(Label::MultiHot(first)) => {
                let width = first.len();
                let data: Vec<i64> = labels
                    .iter()
                    .flat_map(|l| match l {
                        Label::MultiHot(v) => v.iter().map(|&x| i64::from(x > 0.5)).collect(),
                        _ => vec![0; width],
                    })
                    .collect();
                BatchTargets::MultiHot(Tensor::<B, 2, Int>::from_data(
                    TensorData::new(data, [n, width]),
                    &self.device,
                ))
            }
            Some(Label::Value(_)) => {
                let data: Vec<f32> = labels.iter().flat_map(Label::to_values).collect();
                BatchTargets::Values(Tensor::<B, 2>::from_floats(
                    TensorData::new(data, [n, 1]),
                    &self.device,
                ))
            }
            _ => {
                let data: Vec<i64> = labels
                    .iter()
                    .map(|l| match l {
                        Label::Class(c) => *c as i64,
                        _ => 0,
                    })
                    .collect();
                BatchTargets::Classes(Tensor::<B, 1, Int>::from_data(
                    TensorData::new(data, [n]),
                    &self.device,
                ))
            }
        }
    }
}

impl<B: Backend> Batcher<VisitItem, VisitBatch<B>> for VisitBatcher<B> {
    /// Items whose volume shape differs from the first item are dropped.
    fn batch(&self, items: Vec<VisitItem>) -> VisitBatch<B> {
        let dims = items.first().map(VisitItem::dims).unwrap_or([1, 1, 1, 1]);
        let before = items.len();
        let items: Vec<VisitItem> = items.into_iter().filter(|i| i.dims() == dims).collect();
        if items.len() < before {
            warn!("Dropped {} items with mismatched volume shape", before - items.len());
        }
        let batch = items.len();

        let volumes = self.stack_volumes(items.iter().map(|i| &i.volume), dims, batch);
        let high_res = items
            .first()
            .and_then(|i| i.high_res.as_ref())
            .map(|hr| [hr.num_frames, hr.channels, hr.height, hr.width])
            .filter(|hr_dims| {
                items.iter().all(|i| {
                    i.high_res
                        .as_ref()
                        .is_some_and(|h| [h.num_frames, h.channels, h.height, h.width] == *hr_dims)
                })
            })
            .map(|hr_dims| {
                self.stack_volumes(items.iter().filter_map(|i| i.high_res.as_ref()), hr_dims, batch)
            });

        let labels: Vec<Label> = items.iter().map(|i| i.label.clone()).collect();
        VisitBatch {
            volumes,
            high_res,
            targets: self.targets(&labels),
            labels,
            visit_indices: items.iter().map(|i| i.visit_index).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frames::tests::SyntheticSource;
    use crate::data::frames::{AssemblerConfig, FrameSelection};
    use crate::data::index::{IndexOptions, LabelSource};
    use crate::data::loader::{BinaryLists, FrameLayout, VisitMetadata};
    use crate::data::TaskMode;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn subset(indices: Vec<usize>) -> VisitSubset {
        let meta: VisitMetadata = [
            ("A".to_string(), vec!["a1".to_string(), "a2".to_string()]),
            ("B".to_string(), vec!["b1".to_string()]),
        ]
        .into_iter()
        .collect();
        let lists = BinaryLists {
            disease: "AMD".into(),
            with_disease: vec!["A".into()],
            without_disease: vec!["B".into()],
        };
        let mut options = IndexOptions::new(TaskMode::BinaryCls);
        options.layout = FrameLayout { num_frames: 5, ..FrameLayout::default() };
        let index = PatientIndex::build(&meta, &LabelSource::Binary(lists), &options).unwrap();

        let config = AssemblerConfig {
            pad_to_num_frames: Some(4),
            ..AssemblerConfig::default()
        };
        let assembler = SampleAssembler::new(
            FrameSelection::AllFrames,
            config,
            Arc::new(SyntheticSource::new(6, 4)),
        )
        .unwrap();
        VisitSubset::new(Arc::new(index), Arc::new(assembler), indices)
    }

    #[test]
    fn test_replica_shard_sizes() {
        let shard = ReplicaShard::new(4, 0, 0, false).unwrap();
        assert_eq!(shard.num_samples(10), 3);
        assert_eq!(shard.total_size(10), 12);

        let mut all = Vec::new();
        for rank in 0..4 {
            let s = ReplicaShard::new(4, rank, 0, false).unwrap();
            let pos = s.positions(10, 0);
            assert_eq!(pos.len(), 3);
            all.extend(pos);
        }
        all.sort();
        // positions 0 and 1 are repeated as padding
        assert_eq!(all, vec![0, 0, 1, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_replica_shard_shuffle_by_epoch() {
        let shard = ReplicaShard::single(3, true);
        let a = shard.positions(50, 0);
        let b = shard.positions(50, 0);
        let c = shard.positions(50, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(ReplicaShard::new(2, 2, 0, false).is_err());
    }

    #[test]
    fn test_update_indices_changes_view() {
        let mut view = subset(vec![0, 1, 2]);
        assert_eq!(view.len(), 3);
        assert_eq!(view.labels(), vec![Label::Class(1), Label::Class(1), Label::Class(0)]);

        view.update_indices(vec![2]);
        assert_eq!(view.len(), 1);
        let item = view.get(0).unwrap();
        assert_eq!(item.visit_index, 2);
        assert_eq!(item.volume.num_frames, 4);
        assert!(view.get(1).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let view = subset(vec![0, 1, 2]);
        let items: Vec<VisitItem> = (0..view.len()).filter_map(|i| view.get(i)).collect();
        let batcher = VisitBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(items);

        assert_eq!(batch.volumes.dims(), [3, 4, 3, 4, 6]);
        assert!(batch.high_res.is_none());
        assert_eq!(batch.visit_indices, vec![0, 1, 2]);
        match batch.targets {
            BatchTargets::Classes(t) => {
                let values: Vec<i64> = t.into_data().convert::<i64>().to_vec().unwrap();
                assert_eq!(values, vec![1, 1, 0]);
            }
            _ => panic!("expected class targets"),
        }
    }
}
