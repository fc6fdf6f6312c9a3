//! Patient-centric visit index.
//!
//! Flattens the patient -> visit-hash metadata into dense visit indices and
//! keeps the patient <-> visit mappings every downstream split relies on.

use crate::data::loader::{BinaryLists, FrameLayout, MultiLabelTable, VisitMetadata};
use crate::data::{Label, Patient, TaskMode, Visit, NORMAL_CLASS_NAME};
use crate::error::{OctError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Source of patient labels for index construction
#[derive(Debug, Clone)]
pub enum LabelSource {
    Binary(BinaryLists),
    MultiLabel(MultiLabelTable),
    Regression(BTreeMap<String, f32>),
}

/// Options controlling index construction
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub task_mode: TaskMode,
    /// Finding positions kept for multi-task modes; position 0 is always kept
    pub multi_task_idx: Option<Vec<usize>>,
    pub layout: FrameLayout,
}

impl IndexOptions {
    pub fn new(task_mode: TaskMode) -> Self {
        Self {
            task_mode,
            multi_task_idx: None,
            layout: FrameLayout::default(),
        }
    }
}

/// Dense, patient-grouped view of all visits
#[derive(Debug, Clone)]
pub struct PatientIndex {
    task_mode: TaskMode,
    patients: Vec<Patient>,
    patient_lookup: HashMap<String, usize>,
    visits: Vec<Visit>,
    class_to_idx: BTreeMap<String, usize>,
    idx_to_class: BTreeMap<usize, String>,
}

impl PatientIndex {
    /// Build the index from metadata and a label source
    pub fn build(
        metadata: &VisitMetadata,
        labels: &LabelSource,
        options: &IndexOptions,
    ) -> Result<Self> {
        let labelled = match (options.task_mode, labels) {
            (TaskMode::MultiCls, _) => {
                return Err(OctError::UnsupportedTaskMode(
                    "multi_cls has no label table".to_string(),
                ))
            }
            (TaskMode::BinaryCls, LabelSource::Binary(lists)) => binary_patients(lists)?,
            (mode, LabelSource::MultiLabel(table)) if mode.is_multi_label() => {
                multi_label_patients(table, options.multi_task_idx.as_deref())?
            }
            (TaskMode::Regression, LabelSource::Regression(targets)) => targets
                .iter()
                .map(|(pid, v)| LabelledPatient {
                    id: pid.clone(),
                    label: Label::Value(*v),
                    is_normal: false,
                })
                .collect(),
            (mode, _) => {
                return Err(OctError::config(format!(
                    "label source does not match task mode {}",
                    mode
                )))
            }
        };

        let class_names = class_names(options.task_mode, labels, options.multi_task_idx.as_deref());

        let mut index = PatientIndex {
            task_mode: options.task_mode,
            patients: Vec::with_capacity(labelled.len()),
            patient_lookup: HashMap::with_capacity(labelled.len()),
            visits: Vec::new(),
            class_to_idx: class_names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect(),
            idx_to_class: class_names.into_iter().enumerate().collect(),
        };

        for lp in labelled {
            let hashes = metadata.get(&lp.id).ok_or_else(|| {
                OctError::MetadataInconsistency(format!(
                    "patient {} has no entry in the visit metadata",
                    lp.id
                ))
            })?;
            index.push_patient(lp, hashes, &options.layout);
        }

        info!(
            "Indexed {} patients, {} visits ({})",
            index.patients.len(),
            index.visits.len(),
            index.task_mode
        );
        Ok(index)
    }

    fn push_patient(&mut self, lp: LabelledPatient, hashes: &[String], layout: &FrameLayout) {
        let mut visit_indices = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let index = self.visits.len();
            self.visits.push(Visit {
                index,
                patient_id: lp.id.clone(),
                visit_hash: hash.clone(),
                frames: layout.frame_paths(&lp.id, hash),
                label: lp.label.clone(),
            });
            visit_indices.push(index);
        }
        if visit_indices.is_empty() {
            debug!("Patient {} has no visits", lp.id);
        }
        self.patient_lookup.insert(lp.id.clone(), self.patients.len());
        self.patients.push(Patient {
            id: lp.id,
            visit_indices,
            label: lp.label,
            is_normal: lp.is_normal,
        });
    }

    pub fn task_mode(&self) -> TaskMode {
        self.task_mode
    }

    pub fn num_patients(&self) -> usize {
        self.patients.len()
    }

    pub fn num_visits(&self) -> usize {
        self.visits.len()
    }

    pub fn patients(&self) -> &[Patient] {
        &self.patients
    }

    pub fn visit(&self, index: usize) -> Option<&Visit> {
        self.visits.get(index)
    }

    pub fn contains_patient(&self, patient_id: &str) -> bool {
        self.patient_lookup.contains_key(patient_id)
    }

    /// Patient ids in construction order
    pub fn patient_ids(&self) -> impl Iterator<Item = &str> {
        self.patients.iter().map(|p| p.id.as_str())
    }

    /// Sorted ids of patients with at least one visit
    pub fn patients_with_visits(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .patients
            .iter()
            .filter(|p| !p.visit_indices.is_empty())
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Visit indices owned by a patient
    pub fn visits_of(&self, patient_id: &str) -> Option<&[usize]> {
        self.patient_lookup
            .get(patient_id)
            .map(|&i| self.patients[i].visit_indices.as_slice())
    }

    /// Owning patient of a visit
    pub fn patient_of(&self, visit_index: usize) -> Option<&str> {
        self.visits.get(visit_index).map(|v| v.patient_id.as_str())
    }

    /// Concatenate the visits of `patient_ids`, preserving the given order
    pub fn visit_indices_for<S: AsRef<str>>(&self, patient_ids: &[S]) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for pid in patient_ids {
            let pid = pid.as_ref();
            let visits = self.visits_of(pid).ok_or_else(|| {
                OctError::MetadataInconsistency(format!("patient {} is not indexed", pid))
            })?;
            out.extend_from_slice(visits);
        }
        Ok(out)
    }

    /// Visits of majority-class ("normal") patients
    pub fn normal_visit_indices(&self) -> Vec<usize> {
        self.partition_visits(true)
    }

    /// Visits of minority-class ("abnormal") patients
    pub fn abnormal_visit_indices(&self) -> Vec<usize> {
        self.partition_visits(false)
    }

    fn partition_visits(&self, normal: bool) -> Vec<usize> {
        self.patients
            .iter()
            .filter(|p| p.is_normal == normal)
            .flat_map(|p| p.visit_indices.iter().copied())
            .collect()
    }

    pub fn class_to_idx(&self) -> &BTreeMap<String, usize> {
        &self.class_to_idx
    }

    pub fn idx_to_class(&self) -> &BTreeMap<usize, String> {
        &self.idx_to_class
    }

    /// Number of model outputs implied by the label layout
    pub fn num_outputs(&self) -> usize {
        match self.task_mode {
            TaskMode::Regression => 1,
            _ => self.idx_to_class.len(),
        }
    }
}

struct LabelledPatient {
    id: String,
    label: Label,
    is_normal: bool,
}

fn binary_patients(lists: &BinaryLists) -> Result<Vec<LabelledPatient>> {
    let positives: HashSet<&str> = lists.with_disease.iter().map(String::as_str).collect();
    if let Some(dup) = lists
        .without_disease
        .iter()
        .find(|p| positives.contains(p.as_str()))
    {
        return Err(OctError::config(format!(
            "patient {} is listed both with and without {}",
            dup, lists.disease
        )));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(lists.with_disease.len() + lists.without_disease.len());
    let tagged = lists
        .with_disease
        .iter()
        .map(|p| (p, 1usize))
        .chain(lists.without_disease.iter().map(|p| (p, 0usize)));
    for (pid, class) in tagged {
        if !seen.insert(pid.as_str()) {
            warn!("Duplicate patient {} in {} lists, keeping first", pid, lists.disease);
            continue;
        }
        out.push(LabelledPatient {
            id: pid.clone(),
            label: Label::Class(class),
            is_normal: class == 0,
        });
    }
    Ok(out)
}

fn multi_label_patients(
    table: &MultiLabelTable,
    multi_task_idx: Option<&[usize]>,
) -> Result<Vec<LabelledPatient>> {
    let width = table.disease_list.len();
    if let Some(idx) = multi_task_idx {
        if let Some(bad) = idx.iter().find(|&&i| i == 0 || i >= width) {
            return Err(OctError::config(format!(
                "multi-task index {} out of range 1..{}",
                bad, width
            )));
        }
    }

    let mut out = Vec::with_capacity(table.patient_dict.len());
    let mut excluded = 0usize;
    for (pid, full) in &table.patient_dict {
        if full.len() != width || width == 0 {
            return Err(OctError::MetadataInconsistency(format!(
                "patient {} label vector has length {}, expected {}",
                pid,
                full.len(),
                width
            )));
        }
        let is_normal = full.first().copied() == Some(1.0) && full[1..].iter().all(|&v| v == 0.0);
        let label = match multi_task_idx {
            Some(idx) => {
                let projected: Vec<f32> = std::iter::once(full[0])
                    .chain(idx.iter().map(|&i| full[i]))
                    .collect();
                if projected.iter().sum::<f32>() == 0.0 {
                    excluded += 1;
                    continue;
                }
                projected
            }
            None => full.clone(),
        };
        out.push(LabelledPatient {
            id: pid.clone(),
            label: Label::MultiHot(label),
            is_normal,
        });
    }
    if excluded > 0 {
        info!("Excluded {} patients with empty projected labels", excluded);
    }
    Ok(out)
}

fn class_names(
    task_mode: TaskMode,
    labels: &LabelSource,
    multi_task_idx: Option<&[usize]>,
) -> Vec<String> {
    match (task_mode, labels) {
        (TaskMode::BinaryCls, LabelSource::Binary(lists)) => {
            vec![NORMAL_CLASS_NAME.to_string(), lists.disease.clone()]
        }
        (_, LabelSource::MultiLabel(table)) => match multi_task_idx {
            Some(idx) => std::iter::once(0)
                .chain(idx.iter().copied())
                .filter_map(|i| table.disease_list.get(i).cloned())
                .collect(),
            None => table.disease_list.clone(),
        },
        _ => vec!["target".to_string()],
    }
}
