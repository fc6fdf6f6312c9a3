pub mod architecture;
pub mod checkpoint;

use crate::data::FrameSelection;
use crate::error::OctError;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registered classifier variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Linear head over pooled features of the center B-scan
    LinearProbe2d,
    /// Linear head over features pooled across the whole volume
    PooledProbe3d,
    /// Two-layer head over features pooled across the whole volume
    PooledMlp3d,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [
        ModelVariant::LinearProbe2d,
        ModelVariant::PooledProbe3d,
        ModelVariant::PooledMlp3d,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::LinearProbe2d => "linear_probe_2d",
            ModelVariant::PooledProbe3d => "pooled_probe_3d",
            ModelVariant::PooledMlp3d => "pooled_mlp_3d",
        }
    }

    /// 2D variants see the center frame, 3D variants the full volume
    pub fn frame_selection(&self) -> FrameSelection {
        match self {
            ModelVariant::LinearProbe2d => FrameSelection::CenterFrame,
            ModelVariant::PooledProbe3d | ModelVariant::PooledMlp3d => FrameSelection::AllFrames,
        }
    }

    pub fn has_hidden_layer(&self) -> bool {
        matches!(self, ModelVariant::PooledMlp3d)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = OctError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|v| v.name()).collect();
                OctError::config(format!("unknown model '{}', expected one of {:?}", s, known))
            })
    }
}

/// Model configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Classifier variant
    #[config(default = "ModelVariant::PooledProbe3d")]
    pub variant: ModelVariant,

    /// Channels per frame (3 for rgb, 1 for gray)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Number of logits
    #[config(default = "2")]
    pub num_outputs: usize,

    /// Hidden units of the MLP head
    #[config(default = "128")]
    pub hidden_size: usize,

    /// Dropout before the head
    #[config(default = "0.1")]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn for_variant(variant: ModelVariant, in_channels: usize, num_outputs: usize) -> Self {
        Self::new()
            .with_variant(variant)
            .with_in_channels(in_channels)
            .with_num_outputs(num_outputs)
    }

    /// Width of the pooled feature vector fed to the head
    pub fn feature_size(&self) -> usize {
        2 * self.in_channels
    }
}
