//! Patient-level train/val/test partitioning.
//!
//! All splits are decided on patient ids and only then expanded into visit
//! indices, so no patient contributes visits to more than one subset.

use crate::data::loader::SplitLists;
use crate::data::PatientIndex;
use crate::error::{OctError, Result};
use crate::utils::random::seeded_rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

/// Patient ids assigned to each subset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientSplit {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

/// One fold: patient assignment plus expanded visit indices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldSplit {
    /// Fold number, `None` for the single-fold path
    pub fold: Option<usize>,
    pub patients: PatientSplit,
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl FoldSplit {
    /// Label used in per-fold file names
    pub fn tag(&self) -> String {
        match self.fold {
            Some(k) => format!("fold_{}", k),
            None => "singlefold".to_string(),
        }
    }
}

/// Derives folds from a [`PatientIndex`]
pub struct SplitPartitioner<'a> {
    index: &'a PatientIndex,
    few_shot: bool,
}

impl<'a> SplitPartitioner<'a> {
    pub fn new(index: &'a PatientIndex) -> Self {
        Self {
            index,
            few_shot: false,
        }
    }

    /// Swap train and val after splitting
    pub fn with_few_shot(mut self, few_shot: bool) -> Self {
        self.few_shot = few_shot;
        self
    }

    /// Single fold from curated patient lists
    pub fn single_fold(&self, lists: &SplitLists) -> Result<FoldSplit> {
        let train = self.present_sorted(&lists.train, "train");
        let val = self.present_sorted(&lists.val, "val");
        let test = self.present_sorted(&lists.test, "test");
        ensure_disjoint(&[("train", &train), ("val", &val), ("test", &test)])?;

        let patients = self.maybe_swap(PatientSplit { train, val, test });
        self.expand(None, patients)
    }

    /// Patient-grouped k-fold over every patient with at least one visit.
    ///
    /// The sorted patient list is shuffled once with `seed`, then cut into
    /// contiguous validation blocks; the first `n % k` blocks get one extra
    /// patient. Each fold's test subset is its validation subset, so k-fold
    /// test metrics are not held out.
    pub fn k_fold(&self, k: usize, seed: u64) -> Result<Vec<FoldSplit>> {
        let mut keys = self.index.patients_with_visits();
        let n = keys.len();
        if k < 2 {
            return Err(OctError::config(format!("k-fold needs k >= 2, got {}", k)));
        }
        if k > n {
            return Err(OctError::config(format!(
                "cannot split {} patients into {} folds",
                n, k
            )));
        }

        let mut rng = seeded_rng(seed);
        keys.shuffle(&mut rng);

        let mut folds = Vec::with_capacity(k);
        let mut start = 0;
        for fold in 0..k {
            let size = n / k + usize::from(fold < n % k);
            let end = start + size;
            let val: Vec<String> = keys[start..end].to_vec();
            let train: Vec<String> = keys[..start]
                .iter()
                .chain(keys[end..].iter())
                .cloned()
                .collect();
            start = end;

            let mut patients = self.maybe_swap(PatientSplit {
                train,
                val,
                test: Vec::new(),
            });
            patients.test = patients.val.clone();
            folds.push(self.expand(Some(fold), patients)?);
        }
        info!("Built {} patient-grouped folds over {} patients", k, n);
        Ok(folds)
    }

    fn present_sorted(&self, ids: &[String], name: &str) -> Vec<String> {
        let set: BTreeSet<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|p| self.index.contains_patient(p))
            .collect();
        let dropped = ids.len() - set.len();
        if dropped > 0 {
            warn!("{} list: dropped {} unknown or duplicate patient ids", name, dropped);
        }
        set.into_iter().map(str::to_string).collect()
    }

    fn maybe_swap(&self, mut split: PatientSplit) -> PatientSplit {
        if self.few_shot {
            std::mem::swap(&mut split.train, &mut split.val);
        }
        split
    }

    fn expand(&self, fold: Option<usize>, patients: PatientSplit) -> Result<FoldSplit> {
        let train = self.index.visit_indices_for(&patients.train)?;
        let val = self.index.visit_indices_for(&patients.val)?;
        let test = self.index.visit_indices_for(&patients.test)?;
        info!(
            "Split {}: train {} patients/{} visits, val {}/{}, test {}/{}",
            fold.map_or_else(|| "single".to_string(), |k| k.to_string()),
            patients.train.len(),
            train.len(),
            patients.val.len(),
            val.len(),
            patients.test.len(),
            test.len()
        );
        Ok(FoldSplit {
            fold,
            patients,
            train,
            val,
            test,
        })
    }
}

fn ensure_disjoint(subsets: &[(&str, &Vec<String>)]) -> Result<()> {
    for (i, (a_name, a)) in subsets.iter().enumerate() {
        let a_set: HashSet<&String> = a.iter().collect();
        for (b_name, b) in &subsets[i + 1..] {
            if let Some(p) = b.iter().find(|p| a_set.contains(p)) {
                return Err(OctError::config(format!(
                    "patient {} appears in both {} and {} lists",
                    p, a_name, b_name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::index::{IndexOptions, LabelSource};
    use crate::data::loader::{BinaryLists, VisitMetadata};
    use crate::data::TaskMode;

    fn index(n: usize) -> PatientIndex {
        let ids: Vec<String> = (0..n).map(|i| format!("P{:02}", i)).collect();
        let meta: VisitMetadata = ids
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), (0..=(i % 3)).map(|v| format!("{}-{}", p, v)).collect()))
            .collect();
        let (pos, neg) = ids.split_at(n / 2);
        let lists = BinaryLists {
            disease: "AMD".to_string(),
            with_disease: pos.to_vec(),
            without_disease: neg.to_vec(),
        };
        PatientIndex::build(&meta, &LabelSource::Binary(lists), &IndexOptions::new(TaskMode::BinaryCls))
            .unwrap()
    }

    fn owners(index: &PatientIndex, visits: &[usize]) -> HashSet<String> {
        visits
            .iter()
            .map(|&v| index.patient_of(v).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_kfold_fold_sizes() {
        let idx = index(10);
        let folds = SplitPartitioner::new(&idx).k_fold(3, 0).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|f| f.patients.val.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn test_kfold_covers_every_patient_once() {
        let idx = index(11);
        let folds = SplitPartitioner::new(&idx).k_fold(4, 7).unwrap();

        let mut seen: Vec<String> = folds.iter().flat_map(|f| f.patients.val.clone()).collect();
        seen.sort();
        assert_eq!(seen, idx.patients_with_visits());

        for f in &folds {
            let train = owners(&idx, &f.train);
            let val = owners(&idx, &f.val);
            assert!(train.is_disjoint(&val));
            assert_eq!(f.val, f.test);
        }
    }

    #[test]
    fn test_kfold_deterministic() {
        let idx = index(9);
        let a = SplitPartitioner::new(&idx).k_fold(3, 42).unwrap();
        let b = SplitPartitioner::new(&idx).k_fold(3, 42).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.patients, y.patients);
        }
    }

    #[test]
    fn test_kfold_few_shot_tests_on_val() {
        let idx = index(6);
        let folds = SplitPartitioner::new(&idx)
            .with_few_shot(true)
            .k_fold(3, 0)
            .unwrap();

        for f in &folds {
            assert_eq!(f.patients.test, f.patients.val);
            assert_eq!(f.test, f.val);
            // the small block trains, the rest validates
            assert_eq!(f.patients.train.len(), 2);
            assert_eq!(f.patients.val.len(), 4);

            let train = owners(&idx, &f.train);
            let test = owners(&idx, &f.test);
            assert!(train.is_disjoint(&test));
        }
    }

    #[test]
    fn test_kfold_too_many_folds() {
        let idx = index(3);
        assert!(matches!(
            SplitPartitioner::new(&idx).k_fold(5, 0),
            Err(OctError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_fold_intersection_and_few_shot() {
        let idx = index(6);
        let lists = SplitLists {
            train: vec!["P03".into(), "P00".into(), "ghost".into()],
            val: vec!["P01".into()],
            test: vec!["P05".into(), "P04".into()],
        };
        let fold = SplitPartitioner::new(&idx).single_fold(&lists).unwrap();
        assert_eq!(fold.patients.train, vec!["P00", "P03"]);
        assert_eq!(fold.patients.test, vec!["P04", "P05"]);
        assert_eq!(fold.tag(), "singlefold");

        let swapped = SplitPartitioner::new(&idx)
            .with_few_shot(true)
            .single_fold(&lists)
            .unwrap();
        assert_eq!(swapped.patients.train, vec!["P01"]);
        assert_eq!(swapped.patients.val, vec!["P00", "P03"]);
        assert_eq!(swapped.train, idx.visits_of("P01").unwrap());
    }

    #[test]
    fn test_single_fold_rejects_overlap() {
        let idx = index(4);
        let lists = SplitLists {
            train: vec!["P00".into()],
            val: vec!["P00".into()],
            test: vec![],
        };
        assert!(matches!(
            SplitPartitioner::new(&idx).single_fold(&lists),
            Err(OctError::Configuration(_))
        ));
    }
}
