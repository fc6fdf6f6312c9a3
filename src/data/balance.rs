//! Per-epoch majority-class downsampling.

use crate::error::{OctError, Result};
use crate::utils::random::seeded_rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use tracing::debug;

/// Draw `|majority| / factor` majority indices without replacement and append
/// every minority index.
///
/// The generator is seeded with `seed + epoch`, so the result is a pure
/// function of its arguments.
pub fn resample(
    seed: u64,
    epoch: u64,
    majority: &[usize],
    minority: &[usize],
    factor: usize,
    shuffle: bool,
) -> Result<Vec<usize>> {
    if factor == 0 {
        return Err(OctError::config("downsample factor must be >= 1"));
    }
    let mut rng = seeded_rng(seed.wrapping_add(epoch));
    let keep = majority.len() / factor;

    let mut out: Vec<usize> = majority.choose_multiple(&mut rng, keep).copied().collect();
    out.extend_from_slice(minority);
    if shuffle {
        out.shuffle(&mut rng);
    }
    Ok(out)
}

/// Sorted intersection of `base` with `subset`
pub fn restrict_sorted(base: &[usize], subset: &[usize]) -> Vec<usize> {
    let keep: HashSet<usize> = subset.iter().copied().collect();
    let mut out: Vec<usize> = base.iter().copied().filter(|i| keep.contains(i)).collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Tracks the resampled subset across epochs
#[derive(Debug, Clone)]
pub struct ClassBalancer {
    seed: u64,
    factor: usize,
    majority: Vec<usize>,
    minority: Vec<usize>,
    epoch: u64,
    current: Vec<usize>,
}

impl ClassBalancer {
    /// Create a balancer and draw the epoch-0 subset
    pub fn new(seed: u64, factor: usize, majority: Vec<usize>, minority: Vec<usize>) -> Result<Self> {
        let current = resample(seed, 0, &majority, &minority, factor, false)?;
        debug!(
            "Balancer: {} majority, {} minority, keeping {}",
            majority.len(),
            minority.len(),
            current.len()
        );
        Ok(Self {
            seed,
            factor,
            majority,
            minority,
            epoch: 0,
            current,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Indices drawn for the current epoch
    pub fn current(&self) -> &[usize] {
        &self.current
    }

    /// Move to the next epoch and redraw
    pub fn advance_epoch(&mut self) -> Result<&[usize]> {
        self.seek_epoch(self.epoch + 1)
    }

    /// Jump to `epoch` and redraw; the draw depends only on `(seed, epoch)`
    pub fn seek_epoch(&mut self, epoch: u64) -> Result<&[usize]> {
        self.current = resample(
            self.seed,
            epoch,
            &self.majority,
            &self.minority,
            self.factor,
            false,
        )?;
        self.epoch = epoch;
        Ok(&self.current)
    }

    /// Restrict a split's visit indices to the current draw
    pub fn restrict(&self, base: &[usize]) -> Vec<usize> {
        restrict_sorted(base, &self.current)
    }
}
