//! Frame loading and per-visit sample assembly.

use crate::data::{ColorMode, DatasetMode, Label, Visit};
use crate::error::{OctError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where frame images come from
pub trait FrameSource: Send + Sync {
    /// Load a frame by its path relative to the dataset root
    fn load(&self, relative: &Path) -> Result<DynamicImage>;
}

/// Reads frames from a directory on disk
#[derive(Debug, Clone)]
pub struct DiskFrameSource {
    root: PathBuf,
}

impl DiskFrameSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl FrameSource for DiskFrameSource {
    fn load(&self, relative: &Path) -> Result<DynamicImage> {
        let path = self.root.join(relative);
        Ok(ImageReader::open(&path)?.decode()?)
    }
}

/// Image-to-image transform applied to each frame after resize normalization
pub trait FrameTransform: Send + Sync {
    fn apply(&self, image: DynamicImage) -> DynamicImage;
}

/// Resize every frame to a fixed size
#[derive(Debug, Clone, Copy)]
pub struct ResizeTransform {
    pub width: u32,
    pub height: u32,
}

impl FrameTransform for ResizeTransform {
    fn apply(&self, image: DynamicImage) -> DynamicImage {
        image.resize_exact(self.width, self.height, FilterType::Triangle)
    }
}

/// Single frame as CHW floats in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Frame {
    /// Convert an image to the requested color layout
    pub fn from_image(image: &DynamicImage, color: ColorMode) -> Self {
        let (width, height) = image.dimensions();
        let (width, height) = (width as usize, height as usize);
        let plane = width * height;

        match color {
            ColorMode::Gray => {
                let luma = image.to_luma8();
                let data = luma.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
                Frame { channels: 1, height, width, data }
            }
            ColorMode::Rgb => {
                let rgb = image.to_rgb8();
                let mut data = vec![0.0f32; 3 * plane];
                for (i, px) in rgb.pixels().enumerate() {
                    data[i] = px[0] as f32 / 255.0;
                    data[plane + i] = px[1] as f32 / 255.0;
                    data[2 * plane + i] = px[2] as f32 / 255.0;
                }
                Frame { channels: 3, height, width, data }
            }
        }
    }
}

/// Stack of frames laid out as `(frames, channels, height, width)`
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub num_frames: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Channel axis dropped (gray volumes)
    pub squeezed: bool,
    pub data: Vec<f32>,
}

impl Volume {
    /// Stack frames of identical shape
    pub fn stack(frames: Vec<Frame>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| OctError::Image("cannot stack zero frames".to_string()))?;
        let (channels, height, width) = (first.channels, first.height, first.width);
        if let Some(bad) = frames
            .iter()
            .find(|f| (f.channels, f.height, f.width) != (channels, height, width))
        {
            return Err(OctError::Image(format!(
                "frame shape {}x{}x{} differs from {}x{}x{}",
                bad.channels, bad.height, bad.width, channels, height, width
            )));
        }

        let num_frames = frames.len();
        let mut data = Vec::with_capacity(num_frames * channels * height * width);
        for f in frames {
            data.extend(f.data);
        }
        Ok(Volume { num_frames, channels, height, width, squeezed: false, data })
    }

    /// Shape with the channel axis omitted when squeezed
    pub fn shape(&self) -> Vec<usize> {
        if self.squeezed {
            vec![self.num_frames, self.height, self.width]
        } else {
            vec![self.num_frames, self.channels, self.height, self.width]
        }
    }

    pub fn frame_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn frame(&self, i: usize) -> &[f32] {
        let n = self.frame_len();
        &self.data[i * n..(i + 1) * n]
    }

    /// Drop the channel axis of a single-channel volume
    pub fn squeeze_channels(mut self) -> Self {
        if self.channels == 1 {
            self.squeezed = true;
        }
        self
    }

    /// Zero-pad symmetrically or center-crop to `target` frames.
    ///
    /// Padding puts `floor(deficit / 2)` empty frames first. Cropping keeps
    /// `frames[left..n - right]` with `left = floor(excess / 2)`. With
    /// `same_3_frames` an oversized volume becomes its frame `(n - 1) / 2`
    /// repeated three times.
    pub fn pad_or_crop(self, target: usize, same_3_frames: bool) -> Result<Self> {
        let n = self.num_frames;
        let frame_len = self.frame_len();

        if n < target {
            let left = (target - n) / 2;
            let right = target - n - left;
            let mut data = vec![0.0f32; left * frame_len];
            data.extend_from_slice(&self.data);
            data.resize(data.len() + right * frame_len, 0.0);
            Ok(Volume { num_frames: target, data, ..self })
        } else if n > target {
            if same_3_frames {
                if target != 3 {
                    return Err(OctError::config(format!(
                        "same_3_frames needs a 3-frame target, got {}",
                        target
                    )));
                }
                let mid = self.frame((n - 1) / 2).to_vec();
                let data = mid.repeat(3);
                Ok(Volume { num_frames: 3, data, ..self })
            } else {
                let left = (n - target) / 2;
                let data = self.data[left * frame_len..(left + target) * frame_len].to_vec();
                Ok(Volume { num_frames: target, data, ..self })
            }
        } else {
            Ok(self)
        }
    }
}

/// Index of the center frame; the lower middle for even counts
pub fn middle_frame_index(num_frames: usize) -> usize {
    if num_frames % 2 == 0 {
        (num_frames / 2).saturating_sub(1)
    } else {
        num_frames / 2
    }
}

/// Width 1024 becomes 512; height 1024 or 1536 is halved
pub fn normalized_size(width: u32, height: u32) -> (u32, u32) {
    let width = if width == 1024 { 512 } else { width };
    let height = if height == 1024 || height == 1536 { height / 2 } else { height };
    (width, height)
}

fn normalize_resolution(image: DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = normalized_size(w, h);
    if (nw, nh) == (w, h) {
        image
    } else {
        image.resize_exact(nw, nh, FilterType::CatmullRom)
    }
}

/// Which frames of a visit make up a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSelection {
    /// Middle B-scan only
    CenterFrame,
    /// Whole volume
    AllFrames,
}

/// Options shared by both selection strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    pub dataset_mode: DatasetMode,
    pub color: ColorMode,
    pub downsample_width: bool,
    pub return_patient_id: bool,
    pub out_frame_idx: bool,
    pub pad_to_num_frames: Option<usize>,
    pub same_3_frames: bool,
    pub return_both_res: bool,
    pub high_res_num_frames: Option<usize>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            dataset_mode: DatasetMode::Frame,
            color: ColorMode::Rgb,
            downsample_width: true,
            return_patient_id: false,
            out_frame_idx: false,
            pad_to_num_frames: None,
            same_3_frames: false,
            return_both_res: false,
            high_res_num_frames: None,
        }
    }
}

/// Position of the center frame within its visit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePosition {
    pub index: usize,
    pub total: usize,
}

/// Center-frame sample; the variant depends on which extras were requested
#[derive(Debug, Clone)]
pub enum CenterSample {
    Plain {
        frame: Frame,
        label: Label,
    },
    WithPatient {
        frame: Frame,
        label: Label,
        patient_id: String,
    },
    WithPosition {
        frame: Frame,
        label: Label,
        position: FramePosition,
    },
    Full {
        frame: Frame,
        label: Label,
        patient_id: String,
        position: FramePosition,
    },
}

impl CenterSample {
    pub fn frame(&self) -> &Frame {
        match self {
            CenterSample::Plain { frame, .. }
            | CenterSample::WithPatient { frame, .. }
            | CenterSample::WithPosition { frame, .. }
            | CenterSample::Full { frame, .. } => frame,
        }
    }

    pub fn label(&self) -> &Label {
        match self {
            CenterSample::Plain { label, .. }
            | CenterSample::WithPatient { label, .. }
            | CenterSample::WithPosition { label, .. }
            | CenterSample::Full { label, .. } => label,
        }
    }
}

/// Patient and visit a volume came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitOrigin {
    pub patient_id: String,
    pub visit_hash: String,
}

#[derive(Debug, Clone)]
pub struct VolumeSample {
    pub volume: Volume,
    /// Second stream from the high-resolution transform
    pub high_res: Option<Volume>,
    pub label: Label,
    pub origin: Option<VisitOrigin>,
}

#[derive(Debug, Clone)]
pub enum Sample {
    Center(CenterSample),
    Volume(VolumeSample),
}

impl Sample {
    pub fn label(&self) -> &Label {
        match self {
            Sample::Center(c) => c.label(),
            Sample::Volume(v) => &v.label,
        }
    }
}

/// Turns a visit into a model-ready sample
#[derive(Clone)]
pub struct SampleAssembler {
    selection: FrameSelection,
    config: AssemblerConfig,
    source: Arc<dyn FrameSource>,
    transform: Option<Arc<dyn FrameTransform>>,
    high_res_transform: Option<Arc<dyn FrameTransform>>,
}

impl std::fmt::Debug for SampleAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleAssembler")
            .field("selection", &self.selection)
            .field("config", &self.config)
            .finish()
    }
}

impl SampleAssembler {
    pub fn new(
        selection: FrameSelection,
        config: AssemblerConfig,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        if config.same_3_frames && config.pad_to_num_frames != Some(3) {
            return Err(OctError::config(
                "same_3_frames requires padding to exactly 3 frames",
            ));
        }
        Ok(Self {
            selection,
            config,
            source,
            transform: None,
            high_res_transform: None,
        })
    }

    pub fn with_transform(mut self, transform: Arc<dyn FrameTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_high_res_transform(mut self, transform: Arc<dyn FrameTransform>) -> Self {
        self.high_res_transform = Some(transform);
        self
    }

    pub fn selection(&self) -> FrameSelection {
        self.selection
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Channels per frame after color conversion
    pub fn channels(&self) -> usize {
        self.config.color.channels()
    }

    pub fn assemble(&self, visit: &Visit) -> Result<Sample> {
        if visit.frames.is_empty() {
            return Err(OctError::MetadataInconsistency(format!(
                "visit {} of patient {} has no frames",
                visit.visit_hash, visit.patient_id
            )));
        }
        match (self.selection, self.config.dataset_mode) {
            (FrameSelection::CenterFrame, DatasetMode::Frame) => {
                self.center_sample(visit).map(Sample::Center)
            }
            (FrameSelection::CenterFrame, DatasetMode::FrameInferenceAll) => {
                let frames = self.load_frames(visit)?;
                let frames = frames
                    .into_iter()
                    .map(|img| self.finish_frame(img, self.transform.as_deref()))
                    .collect();
                Ok(Sample::Volume(VolumeSample {
                    volume: Volume::stack(frames)?,
                    high_res: None,
                    label: visit.label.clone(),
                    origin: self.origin(visit),
                }))
            }
            (FrameSelection::AllFrames, _) => self.volume_sample(visit).map(Sample::Volume),
        }
    }

    fn center_sample(&self, visit: &Visit) -> Result<CenterSample> {
        let total = visit.num_frames();
        let index = middle_frame_index(total);
        let image = self.load_one(&visit.frames[index])?;
        let frame = self.finish_frame(image, self.transform.as_deref());
        let label = visit.label.clone();
        let position = FramePosition { index, total };

        Ok(match (self.config.return_patient_id, self.config.out_frame_idx) {
            (false, false) => CenterSample::Plain { frame, label },
            (true, false) => CenterSample::WithPatient {
                frame,
                label,
                patient_id: visit.patient_id.clone(),
            },
            (false, true) => CenterSample::WithPosition { frame, label, position },
            (true, true) => CenterSample::Full {
                frame,
                label,
                patient_id: visit.patient_id.clone(),
                position,
            },
        })
    }

    fn volume_sample(&self, visit: &Visit) -> Result<VolumeSample> {
        let images = self.load_frames(visit)?;

        let high_res = match (&self.high_res_transform, self.config.return_both_res) {
            (Some(t), true) => {
                let frames = images
                    .iter()
                    .map(|img| self.finish_frame(img.clone(), Some(t.as_ref())))
                    .collect();
                Some(Volume::stack(frames)?)
            }
            _ => None,
        };
        let frames = images
            .into_iter()
            .map(|img| self.finish_frame(img, self.transform.as_deref()))
            .collect();
        let mut volume = Volume::stack(frames)?;
        let mut high_res = high_res;

        if let Some(target) = self.config.pad_to_num_frames {
            volume = volume.pad_or_crop(target, self.config.same_3_frames)?;
            if let Some(hr) = high_res.take() {
                let hr_target = self.config.high_res_num_frames.unwrap_or(target);
                high_res = Some(hr.pad_or_crop(hr_target, false)?);
            }
        }
        if self.config.color == ColorMode::Gray {
            volume = volume.squeeze_channels();
            high_res = high_res.map(Volume::squeeze_channels);
        }

        Ok(VolumeSample {
            volume,
            high_res,
            label: visit.label.clone(),
            origin: self.origin(visit),
        })
    }

    fn origin(&self, visit: &Visit) -> Option<VisitOrigin> {
        self.config.return_patient_id.then(|| VisitOrigin {
            patient_id: visit.patient_id.clone(),
            visit_hash: visit.visit_hash.clone(),
        })
    }

    fn load_one(&self, path: &Path) -> Result<DynamicImage> {
        let image = self.source.load(path)?;
        Ok(if self.config.downsample_width {
            normalize_resolution(image)
        } else {
            image
        })
    }

    fn load_frames(&self, visit: &Visit) -> Result<Vec<DynamicImage>> {
        visit.frames.iter().map(|p| self.load_one(p)).collect()
    }

    fn finish_frame(&self, image: DynamicImage, transform: Option<&dyn FrameTransform>) -> Frame {
        let image = match transform {
            Some(t) => t.apply(image),
            None => image,
        };
        Frame::from_image(&image, self.config.color)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::sync::Mutex;

    /// Generates gray frames whose pixel value is the frame number
    #[derive(Default)]
    pub(crate) struct SyntheticSource {
        pub width: u32,
        pub height: u32,
        pub loaded: Mutex<Vec<PathBuf>>,
    }

    impl SyntheticSource {
        pub(crate) fn new(width: u32, height: u32) -> Self {
            Self { width, height, loaded: Mutex::new(Vec::new()) }
        }
    }

    impl FrameSource for SyntheticSource {
        fn load(&self, relative: &Path) -> Result<DynamicImage> {
            self.loaded.lock().unwrap().push(relative.to_path_buf());
            let stem = relative.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let value: u8 = stem.trim_start_matches("oct-").parse().unwrap_or(0);
            Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(
                self.width,
                self.height,
                Luma([value]),
            )))
        }
    }

    pub(crate) fn visit(num_frames: usize) -> Visit {
        Visit {
            index: 0,
            patient_id: "P1".to_string(),
            visit_hash: "h1".to_string(),
            frames: (0..num_frames)
                .map(|i| PathBuf::from(format!("P1/macOCT/h1/oct-{:03}.png", i)))
                .collect(),
            label: Label::Class(1),
        }
    }

    fn volume(n: usize) -> Volume {
        let frames = (0..n)
            .map(|i| Frame { channels: 1, height: 1, width: 2, data: vec![i as f32 + 1.0; 2] })
            .collect();
        Volume::stack(frames).unwrap()
    }

    #[test]
    fn test_middle_frame_index() {
        assert_eq!(middle_frame_index(61), 30);
        assert_eq!(middle_frame_index(4), 1);
        assert_eq!(middle_frame_index(2), 0);
        assert_eq!(middle_frame_index(1), 0);
    }

    #[test]
    fn test_normalized_size() {
        assert_eq!(normalized_size(1024, 1024), (512, 512));
        assert_eq!(normalized_size(1024, 1536), (512, 768));
        assert_eq!(normalized_size(512, 496), (512, 496));
    }

    #[test]
    fn test_pad_volume() {
        let padded = volume(5).pad_or_crop(8, false).unwrap();
        assert_eq!(padded.num_frames, 8);
        // one empty frame before, two after
        assert_eq!(padded.frame(0), &[0.0, 0.0]);
        assert_eq!(padded.frame(1), &[1.0, 1.0]);
        assert_eq!(padded.frame(5), &[5.0, 5.0]);
        assert_eq!(padded.frame(6), &[0.0, 0.0]);
        assert_eq!(padded.frame(7), &[0.0, 0.0]);
    }

    #[test]
    fn test_crop_volume() {
        let cropped = volume(10).pad_or_crop(4, false).unwrap();
        assert_eq!(cropped.num_frames, 4);
        assert_eq!(cropped.frame(0), &[4.0, 4.0]);
        assert_eq!(cropped.frame(3), &[7.0, 7.0]);

        let same = volume(4).pad_or_crop(4, false).unwrap();
        assert_eq!(same, volume(4));
    }

    #[test]
    fn test_same_3_frames() {
        let v = volume(7).pad_or_crop(3, true).unwrap();
        assert_eq!(v.num_frames, 3);
        for i in 0..3 {
            assert_eq!(v.frame(i), &[4.0, 4.0]);
        }
        assert!(matches!(
            volume(7).pad_or_crop(5, true),
            Err(OctError::Configuration(_))
        ));
    }

    #[test]
    fn test_center_sample_loads_middle_frame() {
        let source = Arc::new(SyntheticSource::new(8, 6));
        let config = AssemblerConfig { out_frame_idx: true, ..AssemblerConfig::default() };
        let assembler =
            SampleAssembler::new(FrameSelection::CenterFrame, config, source.clone()).unwrap();

        let sample = assembler.assemble(&visit(61)).unwrap();
        match sample {
            Sample::Center(CenterSample::WithPosition { frame, position, .. }) => {
                assert_eq!(position, FramePosition { index: 30, total: 61 });
                assert_eq!(frame.channels, 3);
                assert!((frame.data[0] - 30.0 / 255.0).abs() < 1e-6);
            }
            other => panic!("unexpected sample {:?}", other),
        }
        let loaded = source.loaded.lock().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].ends_with("oct-030.png"));
    }

    #[test]
    fn test_center_sample_even_frame_count() {
        let source = Arc::new(SyntheticSource::new(8, 6));
        let config = AssemblerConfig { out_frame_idx: true, ..AssemblerConfig::default() };
        let assembler =
            SampleAssembler::new(FrameSelection::CenterFrame, config, source.clone()).unwrap();

        match assembler.assemble(&visit(4)).unwrap() {
            Sample::Center(CenterSample::WithPosition { frame, position, .. }) => {
                // lower of the two middle frames
                assert_eq!(position, FramePosition { index: 1, total: 4 });
                assert!((frame.data[0] - 1.0 / 255.0).abs() < 1e-6);
            }
            other => panic!("unexpected sample {:?}", other),
        }
        let loaded = source.loaded.lock().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].ends_with("oct-001.png"));
    }

    #[test]
    fn test_center_sample_variants() {
        let source = Arc::new(SyntheticSource::new(4, 4));
        let config = AssemblerConfig { return_patient_id: true, ..AssemblerConfig::default() };
        let assembler = SampleAssembler::new(FrameSelection::CenterFrame, config, source).unwrap();
        assert!(matches!(
            assembler.assemble(&visit(3)).unwrap(),
            Sample::Center(CenterSample::WithPatient { .. })
        ));
    }

    #[test]
    fn test_volume_sample_gray_padded_with_high_res() {
        let source = Arc::new(SyntheticSource::new(1024, 1024));
        let config = AssemblerConfig {
            color: ColorMode::Gray,
            pad_to_num_frames: Some(8),
            return_both_res: true,
            high_res_num_frames: Some(4),
            ..AssemblerConfig::default()
        };
        let assembler = SampleAssembler::new(FrameSelection::AllFrames, config, source)
            .unwrap()
            .with_transform(Arc::new(ResizeTransform { width: 16, height: 16 }))
            .with_high_res_transform(Arc::new(ResizeTransform { width: 32, height: 32 }));

        let sample = match assembler.assemble(&visit(6)).unwrap() {
            Sample::Volume(v) => v,
            other => panic!("unexpected sample {:?}", other),
        };
        assert_eq!(sample.volume.shape(), vec![8, 16, 16]);
        let hr = sample.high_res.unwrap();
        assert_eq!(hr.shape(), vec![4, 32, 32]);
        assert!(sample.origin.is_none());
    }

    #[test]
    fn test_same_3_frames_requires_target() {
        let source = Arc::new(SyntheticSource::new(4, 4));
        let config = AssemblerConfig {
            same_3_frames: true,
            pad_to_num_frames: Some(5),
            ..AssemblerConfig::default()
        };
        assert!(SampleAssembler::new(FrameSelection::AllFrames, config, source).is_err());
    }
}
