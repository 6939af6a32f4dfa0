//! Pixel combination.
//!
//! Reduces every pixel stack to one output sample: the kept entries' raw
//! values are output-normalized with their file's coefficients, then
//! averaged, or reduced to their median, minimum or maximum. A stack without
//! kept entries falls back to the median of all of its entries.

use common::parallel;
use rayon::prelude::*;

use crate::config::{Combination, IntegrationConfig, OutputNormalization, WeightMode};
use crate::file_set::FileSet;
use crate::stack::{PixelStackEntry, StackStrip, compare_by_raw};

/// Sample type of an integrated plane.
pub trait OutputSample: Copy + Default + Send + Sync + 'static {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl OutputSample for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl OutputSample for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }
}

/// Output normalization coefficients of one channel, indexed by file.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputCoefficients {
    None,
    /// `v + offset[i]`, with `offset[i] = location[0] - location[i]`.
    Additive { offset: Vec<f64> },
    /// `v * factor[i]`, with `factor[i] = location[0] / location[i]`.
    Multiplicative { factor: Vec<f64> },
    /// `(v - location[i]) * scale[i] + location[0]`.
    AdditiveWithScaling { location: Vec<f64>, scale: Vec<f64> },
    /// `v / location[i] * scale[i] * location[0]`.
    MultiplicativeWithScaling { location: Vec<f64>, scale: Vec<f64> },
}

impl OutputCoefficients {
    pub fn new(config: &IntegrationConfig, file_set: &FileSet, channel: usize) -> Self {
        let location: Vec<f64> = file_set.files().iter().map(|f| f.location(channel)).collect();
        let scale = || -> Vec<f64> {
            file_set.files().iter().map(|f| f.scale(channel)).collect()
        };
        let m0 = location[0];
        match config.normalization {
            OutputNormalization::None => Self::None,
            OutputNormalization::Additive => Self::Additive {
                offset: location.iter().map(|m| m0 - m).collect(),
            },
            OutputNormalization::Multiplicative => Self::Multiplicative {
                factor: location.iter().map(|m| m0 / m).collect(),
            },
            OutputNormalization::AdditiveWithScaling => Self::AdditiveWithScaling {
                scale: scale(),
                location,
            },
            OutputNormalization::MultiplicativeWithScaling => Self::MultiplicativeWithScaling {
                scale: scale(),
                location,
            },
        }
    }

    /// Normalized value of raw sample `v` of file `file`.
    pub fn apply(&self, v: f32, file: usize) -> f32 {
        let x = f64::from(v);
        let y = match self {
            Self::None => return v,
            Self::Additive { offset } => x + offset[file],
            Self::Multiplicative { factor } => x * factor[file],
            Self::AdditiveWithScaling { location, scale } => {
                (x - location[file]) * scale[file] + location[0]
            }
            Self::MultiplicativeWithScaling { location, scale } => {
                x / location[file] * scale[file] * location[0]
            }
        };
        y as f32
    }
}

/// Combination settings of one channel.
#[derive(Debug, Clone)]
pub struct CombinationEngine {
    combination: Combination,
    coefficients: OutputCoefficients,
    /// Per-file weights, `None` for a plain average.
    weights: Option<Vec<f64>>,
}

impl CombinationEngine {
    pub fn new(config: &IntegrationConfig, file_set: &FileSet, channel: usize) -> Self {
        let weights = (config.weight_mode != WeightMode::DontCare)
            .then(|| file_set.files().iter().map(|f| f.weight(channel)).collect());
        Self::from_parts(
            config.combination,
            OutputCoefficients::new(config, file_set, channel),
            weights,
        )
    }

    pub fn from_parts(
        combination: Combination,
        coefficients: OutputCoefficients,
        weights: Option<Vec<f64>>,
    ) -> Self {
        Self {
            combination,
            coefficients,
            weights,
        }
    }

    pub fn combination(&self) -> Combination {
        self.combination
    }

    /// Combines the first `n` entries of `stack`, or all of them by their
    /// median when `n` is 0.
    ///
    /// Raw values of the combined entries are replaced by their normalized
    /// values.
    pub fn combine(&self, stack: &mut [PixelStackEntry], n: usize) -> f64 {
        let (n, combination) = if n == 0 {
            (stack.len(), Combination::Median)
        } else {
            (n, self.combination)
        };
        let r = &mut stack[..n];
        if r.is_empty() {
            return 0.0;
        }
        for e in r.iter_mut() {
            e.raw = self.coefficients.apply(e.raw, e.file());
        }

        match combination {
            Combination::Average => match &self.weights {
                None => r.iter().map(|e| f64::from(e.raw)).sum::<f64>() / n as f64,
                Some(weights) => {
                    let (mut sum, mut ws) = (0.0, 0.0);
                    for e in r.iter() {
                        let w = weights[e.file()];
                        sum += w * f64::from(e.raw);
                        ws += w;
                    }
                    sum / ws
                }
            },
            Combination::Median | Combination::Minimum | Combination::Maximum => {
                r.sort_unstable_by(compare_by_raw);
                match combination {
                    Combination::Minimum => f64::from(r[0].raw),
                    Combination::Maximum => f64::from(r[n - 1].raw),
                    _ => {
                        let n2 = n / 2;
                        if n & 1 == 1 {
                            f64::from(r[n2].raw)
                        } else {
                            0.5 * (f64::from(r[n2].raw) + f64::from(r[n2 - 1].raw))
                        }
                    }
                }
            }
        }
    }

    /// Combines every loaded stack of `strip` into `out`, one sample per
    /// stack in row-major order.
    ///
    /// # Panics
    ///
    /// Panics if `out` does not hold exactly one sample per loaded stack.
    pub fn run<T: OutputSample>(&self, strip: &mut StackStrip, out: &mut [T]) {
        assert_eq!(
            out.len(),
            strip.stack_count(),
            "Output rows must match the loaded stacks"
        );
        let (width, files) = (strip.width(), strip.files());
        let (entries, counts) = strip.row_views();
        entries
            .zip(counts)
            .zip(parallel::rows(out, width))
            .par_blocks()
            .for_each(|(_, (entries, counts, out))| {
                for ((stack, &n), o) in entries
                    .chunks_exact_mut(files)
                    .zip(counts.iter())
                    .zip(out.iter_mut())
                {
                    *o = T::from_f64(self.combine(stack, n));
                }
            });
    }
}
