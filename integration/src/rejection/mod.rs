//! Pixel rejection.
//!
//! Every strip of pixel stacks goes through a fixed pipeline:
//!
//! 1. Range rejection of samples at or beyond the range limits.
//! 2. Rejection normalization, making samples of different files comparable.
//! 3. One statistical rejection algorithm.
//!
//! Stages run in parallel over disjoint blocks of stack rows. Range rejected
//! entries are moved behind the kept ones without disturbing file order, so
//! each stack always starts with its kept entries.

mod algorithms;

pub use algorithms::{
    CcdModel, ClipSides, Scratch, averaged_sigma_clip, ccd_clip, linear_fit_clip, min_max,
    percentile, rejection_median, rejection_sigma, sigma_clip, winsorization,
    winsorized_sigma_clip,
};

use rayon::prelude::*;

use crate::config::{IntegrationConfig, Rejection, RejectionNormalization};
use crate::file_set::FileSet;
use crate::stack::{PixelStackEntry, StackStrip};

/// Per-file coefficients of the rejection normalization of one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationCoefficients {
    None,
    /// `(v - location[i]) * scale[i] + location[0]`.
    Scale { location: Vec<f64>, scale: Vec<f64> },
    /// `v * flux[i]`, with `flux[i] = location[0] / location[i]`.
    EqualizeFluxes { flux: Vec<f64> },
}

impl NormalizationCoefficients {
    /// Coefficients of `channel` for the normalization selected by `config`.
    pub fn new(config: &IntegrationConfig, file_set: &FileSet, channel: usize) -> Self {
        if config.rejection.is_none() {
            return Self::None;
        }
        let location: Vec<f64> = file_set.files().iter().map(|f| f.location(channel)).collect();
        match config.rejection_normalization {
            RejectionNormalization::None => Self::None,
            RejectionNormalization::Scale => Self::Scale {
                scale: file_set.files().iter().map(|f| f.scale(channel)).collect(),
                location,
            },
            RejectionNormalization::EqualizeFluxes => Self::EqualizeFluxes {
                flux: location.iter().map(|m| location[0] / m).collect(),
            },
        }
    }
}

/// Rejection settings of one run, applied strip by strip.
#[derive(Debug, Clone)]
pub struct RejectionEngine {
    algorithm: Rejection,
    sides: ClipSides,
    range_low: Option<f32>,
    range_high: Option<f32>,
    normalization: NormalizationCoefficients,
    ccd: Option<CcdModel>,
}

impl RejectionEngine {
    pub fn new(config: &IntegrationConfig, normalization: NormalizationCoefficients) -> Self {
        let ccd = match config.rejection {
            Rejection::CcdNoise {
                gain,
                read_noise,
                scale_noise,
                ..
            } => Some(CcdModel::new(gain, read_noise, scale_noise)),
            _ => None,
        };
        Self {
            algorithm: config.rejection,
            sides: ClipSides {
                low: config.clip_low,
                high: config.clip_high,
            },
            range_low: config.range_clip_low.then_some(config.range_low),
            range_high: config.range_clip_high.then_some(config.range_high),
            normalization,
            ccd,
        }
    }

    /// Any stage of the pipeline is active.
    pub fn is_active(&self) -> bool {
        self.has_range() || !self.algorithm.is_none()
    }

    fn has_range(&self) -> bool {
        self.range_low.is_some() || self.range_high.is_some()
    }

    /// Runs the pipeline over every loaded stack of `strip`.
    pub fn run(&self, strip: &mut StackStrip) {
        if !self.is_active() {
            return;
        }
        let (width, files) = (strip.width(), strip.files());
        strip
            .par_row_blocks_with_slopes()
            .for_each(|(_, (entries, counts, slopes))| {
                let mut scratch = Scratch::default();
                for ((row, row_counts), row_slopes) in entries
                    .chunks_exact_mut(width * files)
                    .zip(counts.chunks_exact_mut(width))
                    .zip(slopes.chunks_exact_mut(width))
                {
                    self.process_row(row, files, row_counts, row_slopes, &mut scratch);
                }
            });
    }

    /// One image row of stacks, `files` entries each.
    fn process_row(
        &self,
        row: &mut [PixelStackEntry],
        files: usize,
        counts: &mut [usize],
        slopes: &mut [f32],
        scratch: &mut Scratch,
    ) {
        if self.has_range() {
            for (stack, n) in row.chunks_exact_mut(files).zip(counts.iter_mut()) {
                *n = self.range_reject(stack, *n);
            }
        }
        if self.algorithm.is_none() {
            return;
        }
        self.normalize_row(row);
        for ((stack, n), slope) in row
            .chunks_exact_mut(files)
            .zip(counts.iter_mut())
            .zip(slopes.iter_mut())
        {
            *n = self.reject(stack, *n, slope, scratch);
        }
    }

    /// Flags samples at or below the low range limit, or at or above the high
    /// one, then moves them behind the kept entries.
    pub fn range_reject(&self, stack: &mut [PixelStackEntry], n: usize) -> usize {
        if n < 1 {
            return n;
        }
        let mut nr = 0;
        for e in &mut stack[..n] {
            if self.range_low.is_some_and(|low| e.value <= low) {
                e.range_low = true;
                nr += 1;
            } else if self.range_high.is_some_and(|high| e.value >= high) {
                e.range_high = true;
                nr += 1;
            }
        }
        if nr > 0 {
            stack.sort_by_key(PixelStackEntry::is_rejected);
        }
        n - nr
    }

    /// Normalizes the kept entries of all stacks of one image row.
    ///
    /// Scale normalization keeps the row non-negative: if any normalized
    /// value falls below zero, every kept entry of the row is raised by the
    /// same amount.
    pub fn normalize_row(&self, row: &mut [PixelStackEntry]) {
        match &self.normalization {
            NormalizationCoefficients::None => {}
            NormalizationCoefficients::Scale { location, scale } => {
                let m0 = location[0];
                let mut rmin = 0.0f32;
                for e in row.iter_mut().filter(|e| e.index != 0 && !e.is_rejected()) {
                    let i = e.file();
                    e.value = ((f64::from(e.value) - location[i]) * scale[i] + m0) as f32;
                    rmin = rmin.min(e.value);
                }
                if rmin < 0.0 {
                    for e in row.iter_mut().filter(|e| !e.is_rejected()) {
                        e.value -= rmin;
                    }
                }
            }
            NormalizationCoefficients::EqualizeFluxes { flux } => {
                for e in row.iter_mut().filter(|e| e.index != 0 && !e.is_rejected()) {
                    e.value = (f64::from(e.value) * flux[e.file()]) as f32;
                }
            }
        }
    }

    /// Statistical rejection of one stack with `n` kept entries.
    pub fn reject(
        &self,
        stack: &mut [PixelStackEntry],
        n: usize,
        slope: &mut f32,
        scratch: &mut Scratch,
    ) -> usize {
        let sides = self.sides;
        match self.algorithm {
            Rejection::None => n,
            Rejection::MinMax { low, high } => min_max(stack, n, low, high, sides),
            Rejection::Percentile { low, high } => {
                percentile(stack, n, f64::from(low), f64::from(high), sides)
            }
            Rejection::Sigma { low, high } => {
                sigma_clip(stack, n, f64::from(low), f64::from(high), sides)
            }
            Rejection::WinsorizedSigma { low, high } => winsorized_sigma_clip(
                stack,
                n,
                f64::from(low),
                f64::from(high),
                sides,
                scratch,
            ),
            Rejection::AveragedSigma { low, high } => {
                averaged_sigma_clip(stack, n, f64::from(low), f64::from(high), sides)
            }
            Rejection::LinearFit { low, high } => linear_fit_clip(
                stack,
                n,
                f64::from(low),
                f64::from(high),
                sides,
                slope,
                scratch,
            ),
            Rejection::CcdNoise { low, high, .. } => match &self.ccd {
                Some(model) => ccd_clip(stack, n, model, f64::from(low), f64::from(high), sides),
                None => n,
            },
        }
    }
}
