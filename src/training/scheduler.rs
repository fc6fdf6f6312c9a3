use serde::{Deserialize, Serialize};

/// Learning rate schedules keyed by fractional epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Linear warmup, then half-cycle cosine down to `min_lr`
    WarmupCosine {
        lr: f64,
        min_lr: f64,
        warmup_epochs: f64,
        total_epochs: f64,
    },
}

impl LearningRateScheduler {
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    pub fn warmup_cosine(lr: f64, min_lr: f64, warmup_epochs: usize, total_epochs: usize) -> Self {
        Self::WarmupCosine {
            lr,
            min_lr,
            warmup_epochs: warmup_epochs as f64,
            total_epochs: total_epochs as f64,
        }
    }

    /// Learning rate at `epoch`, where `epoch` may be fractional (`step / steps_per_epoch + epoch`)
    pub fn get_lr(&self, epoch: f64) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::WarmupCosine { lr, min_lr, warmup_epochs, total_epochs } => {
                if epoch < warmup_epochs {
                    lr * epoch / warmup_epochs
                } else {
                    let span = (total_epochs - warmup_epochs).max(f64::EPSILON);
                    let progress = ((epoch - warmup_epochs) / span).min(1.0);
                    min_lr + (lr - min_lr) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
                }
            }
        }
    }

    /// Peak learning rate
    pub fn base_lr(&self) -> f64 {
        match *self {
            Self::Constant { lr } | Self::WarmupCosine { lr, .. } => lr,
        }
    }
}

impl Default for LearningRateScheduler {
    fn default() -> Self {
        Self::constant(1e-3)
    }
}

/// Named slice of parameters with its own learning rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    /// Multiplier on the scheduled rate (layer-wise decay)
    pub lr_scale: f64,
    /// Accumulated halvings from non-finite recovery
    pub recovery_scale: f64,
    /// Rate applied at the last update
    pub lr: f64,
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, lr_scale: f64) -> Self {
        Self {
            name: name.into(),
            lr_scale,
            recovery_scale: 1.0,
            lr: 0.0,
        }
    }
}

/// Parameter groups driven by one schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
}

impl ParamGroups {
    /// Groups ordered from the input side to the head, with `decay^(depth - i)` scales
    pub fn layer_decayed(names: &[&str], decay: f64) -> Self {
        let depth = names.len().saturating_sub(1);
        let groups = names
            .iter()
            .enumerate()
            .map(|(i, name)| ParamGroup::new(*name, decay.powi((depth - i) as i32)))
            .collect();
        Self { groups }
    }

    /// Set every group's rate from the scheduled base rate
    pub fn adjust(&mut self, scheduled_lr: f64) {
        for g in &mut self.groups {
            g.lr = scheduled_lr * g.lr_scale * g.recovery_scale;
        }
    }

    /// Multiply every group's persistent recovery scale
    pub fn scale(&mut self, factor: f64) {
        for g in &mut self.groups {
            g.recovery_scale *= factor;
            g.lr *= factor;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Rate of the named group, falling back to zero
    pub fn lr_of(&self, name: &str) -> f64 {
        self.get(name).map_or(0.0, |g| g.lr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamGroup> {
        self.groups.iter()
    }
}
