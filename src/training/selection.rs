//! Best-epoch tracking for validation-driven model selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OctError, Result};

/// Initial value of every best-so-far metric
pub const METRIC_SENTINEL: f64 = -0.01;

/// Metrics one evaluation pass reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricTriple {
    pub auc: f64,
    pub acc: f64,
    pub auprc: f64,
    pub bal_acc: Option<f64>,
}

/// Metric that drives best-epoch selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ValMetric {
    #[serde(rename = "AUC")]
    Auc,
    #[default]
    #[serde(rename = "AUPRC")]
    Auprc,
}

impl FromStr for ValMetric {
    type Err = OctError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AUC" => Ok(ValMetric::Auc),
            "AUPRC" => Ok(ValMetric::Auprc),
            other => Err(OctError::config(format!(
                "validation metric must be AUC or AUPRC, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ValMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValMetric::Auc => f.write_str("AUC"),
            ValMetric::Auprc => f.write_str("AUPRC"),
        }
    }
}

/// Best-so-far metrics and the epoch they were last updated at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub auc: f64,
    pub acc: f64,
    pub auprc: f64,
    pub bal_acc: f64,
    pub epoch: usize,
}

impl Default for BestRecord {
    fn default() -> Self {
        Self {
            auc: METRIC_SENTINEL,
            acc: METRIC_SENTINEL,
            auprc: METRIC_SENTINEL,
            bal_acc: METRIC_SENTINEL,
            epoch: 0,
        }
    }
}

impl BestRecord {
    /// Record of exactly these metrics at `epoch`
    pub fn snapshot(m: &MetricTriple, epoch: usize) -> Self {
        Self {
            auc: m.auc,
            acc: m.acc,
            auprc: m.auprc,
            bal_acc: m.bal_acc.unwrap_or(METRIC_SENTINEL),
            epoch,
        }
    }

    /// Apply one epoch's metrics; returns whether the epoch is a new best.
    ///
    /// Comparisons are non-strict, so a tie on the primary metric can still
    /// produce a new best through the secondary checks.
    pub fn update(&mut self, metric: ValMetric, m: &MetricTriple, epoch: usize) -> bool {
        match metric {
            ValMetric::Auprc => self.update_auprc(m, epoch),
            ValMetric::Auc => self.update_auc(m, epoch),
        }
    }

    fn update_auprc(&mut self, m: &MetricTriple, epoch: usize) -> bool {
        if !(self.auprc <= m.auprc) {
            return false;
        }
        let mut is_best = false;
        if self.auprc < m.auprc {
            self.epoch = epoch;
            self.auc = m.auc;
            self.acc = m.acc;
            is_best = true;
        }
        self.auprc = m.auprc;

        if self.acc <= m.acc {
            self.acc = m.acc;
            self.auc = m.auc;
            self.epoch = epoch;
            is_best = true;
        } else if self.auc <= m.auc {
            self.auc = m.auc;
            self.acc = m.acc;
            self.epoch = epoch;
            is_best = true;
        }

        if let Some(b) = m.bal_acc {
            self.bal_acc = b;
        }
        is_best
    }

    fn update_auc(&mut self, m: &MetricTriple, epoch: usize) -> bool {
        if !(self.auc <= m.auc) {
            return false;
        }
        // auc is overwritten before any strict comparison could see the gain
        self.auc = m.auc;
        if self.acc <= m.acc {
            self.acc = m.acc;
            self.epoch = epoch;
            true
        } else if self.auprc <= m.auprc {
            self.auprc = m.auprc;
            self.epoch = epoch;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for BestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}: auc {:.4}, acc {:.4}, auprc {:.4}",
            self.epoch, self.auc, self.acc, self.auprc
        )?;
        if self.bal_acc != METRIC_SENTINEL {
            write!(f, ", bal_acc {:.4}", self.bal_acc)?;
        }
        Ok(())
    }
}

/// Selection state carried through one fold
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionState {
    pub best_val: BestRecord,
    pub best_test: BestRecord,
    /// Test metrics from the most recent test pass
    pub test_at_best_val: BestRecord,
    pub early_stop_counter: usize,
}

impl SelectionState {
    pub fn observe_val(&mut self, metric: ValMetric, m: &MetricTriple, epoch: usize) -> bool {
        let is_best = self.best_val.update(metric, m, epoch);
        if is_best {
            self.early_stop_counter = 0;
        }
        is_best
    }

    /// Update the test tracker and overwrite the snapshot
    pub fn observe_test(&mut self, metric: ValMetric, m: &MetricTriple, epoch: usize) -> bool {
        self.test_at_best_val = BestRecord::snapshot(m, epoch);
        self.best_test.update(metric, m, epoch)
    }

    /// Count a non-best epoch; true once the counter exceeds `patience`
    pub fn register_stale_epoch(&mut self, patience: usize) -> bool {
        self.early_stop_counter += 1;
        self.early_stop_counter > patience
    }
}
