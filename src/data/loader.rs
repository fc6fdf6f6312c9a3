use crate::data::{AVAILABLE_DISEASES, DEFAULT_OCT_FRAMES};
use crate::error::{OctError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Patient id -> visit hashes, in metadata order
pub type VisitMetadata = BTreeMap<String, Vec<String>>;

/// Imaging modality stored per visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    #[default]
    Oct,
    Ir,
}

/// Directory layout of frames under the dataset root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLayout {
    pub modality: Modality,
    /// Frames per OCT visit
    pub num_frames: usize,
    /// Directory between the patient id and the visit hash
    pub midfix: String,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            modality: Modality::Oct,
            num_frames: DEFAULT_OCT_FRAMES,
            midfix: "macOCT".to_string(),
        }
    }
}

impl FrameLayout {
    /// Frame paths of one visit relative to the dataset root
    pub fn frame_paths(&self, patient_id: &str, visit_hash: &str) -> Vec<PathBuf> {
        let visit_dir = PathBuf::from(patient_id).join(&self.midfix).join(visit_hash);
        match self.modality {
            Modality::Oct => (0..self.num_frames)
                .map(|i| visit_dir.join(format!("oct-{:03}.png", i)))
                .collect(),
            Modality::Ir => vec![visit_dir.join("ir.png")],
        }
    }
}

/// Binary patient lists for one disease
#[derive(Debug, Clone, Default)]
pub struct BinaryLists {
    pub disease: String,
    pub with_disease: Vec<String>,
    pub without_disease: Vec<String>,
}

/// Multi-label table: finding names and per-patient label vectors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiLabelTable {
    pub disease_list: Vec<String>,
    pub patient_dict: BTreeMap<String, Vec<f32>>,
}

/// Open a file, transparently decompressing `.gz`
fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| {
        OctError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open {:?}: {}", path, e),
        ))
    })?;
    let is_gz = path.extension().and_then(|e| e.to_str()) == Some("gz");
    if is_gz {
        debug!("Reading gzipped file {:?}", path);
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Load the patient -> visit hash mapping (`.json` or `.json.gz`)
pub fn load_visit_metadata<P: AsRef<Path>>(path: P) -> Result<VisitMetadata> {
    let path = path.as_ref();
    info!("Loading visit metadata from {:?}", path);
    let reader = BufReader::new(open_reader(path)?);
    let metadata: VisitMetadata = serde_json::from_reader(reader)?;

    let num_visits: usize = metadata.values().map(Vec::len).sum();
    info!(
        "Loaded metadata for {} patients, {} visits",
        metadata.len(),
        num_visits
    );
    Ok(metadata)
}

/// Read a newline-separated patient id list, skipping blank lines
pub fn load_patient_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let reader = BufReader::new(open_reader(path)?);
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    debug!("Read {} patient ids from {:?}", ids.len(), path);
    Ok(ids)
}

/// Load `<DISEASE>_w_disease.txt` and `<DISEASE>_wo_disease.txt` from `dir`
pub fn load_binary_lists<P: AsRef<Path>>(dir: P, disease: &str) -> Result<BinaryLists> {
    if !AVAILABLE_DISEASES.contains(&disease) {
        return Err(OctError::config(format!(
            "unknown disease '{}', expected one of {:?}",
            disease, AVAILABLE_DISEASES
        )));
    }
    let dir = dir.as_ref();
    let with_disease = load_patient_list(dir.join(format!("{}_w_disease.txt", disease)))?;
    let without_disease = load_patient_list(dir.join(format!("{}_wo_disease.txt", disease)))?;
    info!(
        "{}: {} patients with disease, {} without",
        disease,
        with_disease.len(),
        without_disease.len()
    );
    Ok(BinaryLists {
        disease: disease.to_string(),
        with_disease,
        without_disease,
    })
}

/// Load the multi-label table, typically `multilabel_cls_dict.json`
pub fn load_multilabel_table<P: AsRef<Path>>(path: P) -> Result<MultiLabelTable> {
    let path = path.as_ref();
    let reader = BufReader::new(open_reader(path)?);
    let table: MultiLabelTable = serde_json::from_reader(reader)?;

    let width = table.disease_list.len();
    if let Some((pid, v)) = table.patient_dict.iter().find(|(_, v)| v.len() != width) {
        return Err(OctError::MetadataInconsistency(format!(
            "patient {} has a label vector of length {}, expected {}",
            pid,
            v.len(),
            width
        )));
    }
    info!(
        "Loaded multi-label table: {} findings, {} patients",
        width,
        table.patient_dict.len()
    );
    Ok(table)
}

/// Load patient -> continuous target mapping for regression
pub fn load_regression_targets<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, f32>> {
    let reader = BufReader::new(open_reader(path.as_ref())?);
    let targets: BTreeMap<String, f32> = serde_json::from_reader(reader)?;
    if targets.values().any(|v| !v.is_finite()) {
        warn!("Regression targets contain non-finite values");
    }
    Ok(targets)
}

/// Curated patient lists for a single-fold split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitLists {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

/// Load `{train,val,test}_pat_list.txt` from `dir`
pub fn load_split_lists<P: AsRef<Path>>(dir: P) -> Result<SplitLists> {
    let dir = dir.as_ref();
    Ok(SplitLists {
        train: load_patient_list(dir.join("train_pat_list.txt"))?,
        val: load_patient_list(dir.join("val_pat_list.txt"))?,
        test: load_patient_list(dir.join("test_pat_list.txt"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_frame_paths() {
        let layout = FrameLayout::default();
        let paths = layout.frame_paths("P1", "abc");
        assert_eq!(paths.len(), 61);
        assert_eq!(paths[0], PathBuf::from("P1/macOCT/abc/oct-000.png"));
        assert_eq!(paths[60], PathBuf::from("P1/macOCT/abc/oct-060.png"));

        let ir = FrameLayout {
            modality: Modality::Ir,
            ..FrameLayout::default()
        };
        assert_eq!(ir.frame_paths("P1", "abc"), vec![PathBuf::from("P1/macOCT/abc/ir.png")]);
    }

    #[test]
    fn test_load_metadata_plain_and_gz() {
        let dir = TempDir::new().unwrap();
        let json = r#"{"P1": ["a", "b"], "P2": ["c"]}"#;

        let plain = dir.path().join("meta.json");
        std::fs::write(&plain, json).unwrap();
        let meta = load_visit_metadata(&plain).unwrap();
        assert_eq!(meta["P1"], vec!["a", "b"]);

        let gz = dir.path().join("meta.json.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(json.as_bytes()).unwrap();
        enc.finish().unwrap();
        assert_eq!(load_visit_metadata(&gz).unwrap(), meta);
    }

    #[test]
    fn test_binary_lists() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AMD_w_disease.txt"), "P1\nP2\n\n").unwrap();
        std::fs::write(dir.path().join("AMD_wo_disease.txt"), "P3\n").unwrap();

        let lists = load_binary_lists(dir.path(), "AMD").unwrap();
        assert_eq!(lists.with_disease, vec!["P1", "P2"]);
        assert_eq!(lists.without_disease, vec!["P3"]);

        assert!(matches!(
            load_binary_lists(dir.path(), "XYZ"),
            Err(OctError::Configuration(_))
        ));
    }

    #[test]
    fn test_multilabel_width_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("multilabel_cls_dict.json");
        std::fs::write(
            &path,
            r#"{"disease_list": ["normal", "AMD"], "patient_dict": {"P1": [1, 0, 0]}}"#,
        )
        .unwrap();
        assert!(matches!(
            load_multilabel_table(&path),
            Err(OctError::MetadataInconsistency(_))
        ));
    }
}
