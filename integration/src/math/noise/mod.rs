//! Gaussian noise estimation from the starlet (a trous) wavelet transform.
//!
//! The multiresolution support estimator (Starck & Murtagh 1998) selects the
//! pixels that are not significant at any wavelet scale and measures the
//! standard deviation of the image minus its smooth residual on them. A plain
//! k-sigma estimate on the first wavelet layer seeds it and serves as the
//! fallback.

#[cfg(test)]
mod tests;

use rayon::prelude::*;

use super::statistics::{mean_of_squares, std_dev};

/// Separable B3 spline scaling function.
pub const B3_KERNEL: [f32; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// Standard deviation of unit Gaussian noise at each B3 wavelet scale.
pub const B3_NOISE_SCALING: [f64; 10] = [
    0.8907, 0.2007, 0.0856, 0.0413, 0.0205, 0.0103, 0.0052, 0.0026, 0.0013, 0.0007,
];

/// Samples at or beyond these limits are excluded from noise estimation.
pub const NOISE_LOW: f32 = 0.00002;
pub const NOISE_HIGH: f32 = 0.99998;

/// Wavelet layers tried by [`evaluate_noise`], from most to fewest.
pub const MRS_MAX_LAYERS: usize = 4;

const MRS_K: f64 = 3.0;
const MRS_ACCURACY: f64 = 1.0e-4;
const MRS_MAX_ITERATIONS: usize = 16;
/// Corrects a 2% systematic bias of the MRS estimator.
const MRS_BIAS: f64 = 0.974;

/// Starlet decomposition of a single-channel image.
#[derive(Debug, Clone)]
pub struct WaveletTransform {
    pub width: usize,
    pub height: usize,
    /// Detail layers, finest first.
    pub layers: Vec<Vec<f32>>,
    /// Smooth residual after the last layer.
    pub residual: Vec<f32>,
}

impl WaveletTransform {
    /// Decomposes `image` into `layers` detail layers plus a residual.
    pub fn new(image: &[f32], width: usize, height: usize, layers: usize) -> Self {
        assert_eq!(image.len(), width * height, "Image size must match {width}x{height}");
        let mut current = image.to_vec();
        let mut details = Vec::with_capacity(layers);
        for j in 0..layers {
            let smooth = b3_smooth(&current, width, height, 1 << j);
            let detail: Vec<f32> = current.iter().zip(&smooth).map(|(c, s)| c - s).collect();
            details.push(detail);
            current = smooth;
        }
        Self {
            width,
            height,
            layers: details,
            residual: current,
        }
    }

    /// Residual of a decomposition truncated to the first `n` layers.
    pub fn residual_at(&self, n: usize) -> Vec<f32> {
        let mut residual = self.residual.clone();
        for layer in &self.layers[n.min(self.layers.len())..] {
            for (r, w) in residual.iter_mut().zip(layer) {
                *r += w;
            }
        }
        residual
    }
}

/// One B3 smoothing pass with holes of `step` pixels, mirrored at the borders.
fn b3_smooth(data: &[f32], width: usize, height: usize, step: usize) -> Vec<f32> {
    let mut rows = vec![0.0f32; data.len()];
    rows.par_chunks_mut(width)
        .zip(data.par_chunks(width))
        .for_each(|(out, row)| {
            for (x, o) in out.iter_mut().enumerate() {
                *o = B3_KERNEL
                    .iter()
                    .enumerate()
                    .map(|(t, k)| {
                        let dx = (t as isize - 2) * step as isize;
                        k * row[mirror(x as isize + dx, width)]
                    })
                    .sum();
            }
        });

    let mut out = vec![0.0f32; data.len()];
    out.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, out_row)| {
            let sources: [usize; 5] = std::array::from_fn(|t| {
                let dy = (t as isize - 2) * step as isize;
                mirror(y as isize + dy, height) * width
            });
            for (x, o) in out_row.iter_mut().enumerate() {
                *o = B3_KERNEL
                    .iter()
                    .zip(&sources)
                    .map(|(k, &s)| k * rows[s + x])
                    .sum();
            }
        });
    out
}

/// Reflects an out-of-range index back into `0..n`.
fn mirror(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Iterative k-sigma clipped standard deviation of `layer`, restricted to the
/// pixels whose `image` values lie inside `(low, high)`.
///
/// Stops after `max_iterations` or when the estimate changes by less than the
/// fraction `eps`.
pub fn noise_k_sigma(
    layer: &[f32],
    image: &[f32],
    low: f32,
    high: f32,
    k: f64,
    eps: f64,
    max_iterations: usize,
) -> f64 {
    let mut a: Vec<f64> = layer
        .iter()
        .zip(image)
        .filter(|&(_, &v)| v > low && v < high)
        .map(|(&w, _)| f64::from(w))
        .collect();

    let mut s0 = 0.0;
    let mut it = 0;
    loop {
        if a.len() < 2 {
            return 0.0;
        }
        let s = std_dev(&a);
        if 1.0 + s == 1.0 {
            return 0.0;
        }
        it += 1;
        if it == max_iterations || (eps > 0.0 && it > 1 && (s0 - s) / s0 < eps) {
            return s;
        }
        s0 = s;
        let ks = k * s;
        a.retain(|w| w.abs() < ks);
    }
}

/// Multiresolution support noise estimate using the first `n` layers of
/// `transform`.
///
/// Returns the noise standard deviation and the number of pixels it is based
/// on, or `(0.0, 0)` if the iteration collapses or does not converge.
#[allow(clippy::too_many_arguments)]
pub fn noise_mrs(
    transform: &WaveletTransform,
    n: usize,
    image: &[f32],
    scaling: &[f64],
    sigma: f64,
    k: f64,
    low: f32,
    high: f32,
) -> (f64, usize) {
    if image.len() < 9 {
        return (0.0, 0);
    }
    let mut sigma = sigma;
    if 1.0 + sigma == 1.0 {
        let all: Vec<f64> = image.iter().map(|&v| f64::from(v)).collect();
        sigma = std_dev(&all);
        if 1.0 + sigma == 1.0 {
            return (0.0, 0);
        }
    }

    let layers = &transform.layers[..n.min(transform.layers.len())];
    let residual = transform.residual_at(n);
    let mut support = Vec::with_capacity(image.len());

    for it in 0.. {
        let thresholds: Vec<f64> = scaling
            .iter()
            .take(layers.len())
            .map(|s| k * sigma * s)
            .collect();

        support.clear();
        support.extend(
            image
                .iter()
                .enumerate()
                .filter(|&(i, &v)| {
                    v > low
                        && v < high
                        && layers
                            .iter()
                            .zip(&thresholds)
                            .all(|(w, &t)| f64::from(w[i].abs()) <= t)
                })
                .map(|(i, &v)| f64::from(v - residual[i])),
        );

        if support.len() < 2 {
            return (0.0, 0);
        }
        let new_sigma = std_dev(&support);
        if 1.0 + new_sigma == 1.0 {
            return (0.0, 0);
        }
        let e = (new_sigma - sigma).abs() / new_sigma;
        sigma = new_sigma;
        if e < MRS_ACCURACY {
            break;
        }
        if it > MRS_MAX_ITERATIONS {
            return (0.0, 0);
        }
    }

    (sigma / MRS_BIAS, support.len())
}

/// Result of [`evaluate_noise`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseEstimate {
    pub sigma: f64,
    /// Number of wavelet layers of the accepted MRS estimate, 0 if the
    /// k-sigma fallback was used.
    pub layers: usize,
}

/// Estimates the standard deviation of Gaussian noise in a single-channel
/// image, trying 4 down to 2 wavelet layers and falling back to the k-sigma
/// estimate if none is based on at least `min_data_fraction` of the pixels.
pub fn evaluate_noise(
    image: &[f32],
    width: usize,
    height: usize,
    min_data_fraction: f64,
) -> NoiseEstimate {
    let transform = WaveletTransform::new(image, width, height, MRS_MAX_LAYERS);
    let s0 = noise_k_sigma(
        &transform.layers[0],
        image,
        NOISE_LOW,
        NOISE_HIGH,
        MRS_K,
        0.01,
        10,
    ) / B3_NOISE_SCALING[0];

    let min_count = (min_data_fraction * image.len() as f64) as usize;
    for n in (2..=MRS_MAX_LAYERS).rev() {
        let (sigma, count) = noise_mrs(
            &transform,
            n,
            image,
            &B3_NOISE_SCALING,
            s0,
            MRS_K,
            NOISE_LOW,
            NOISE_HIGH,
        );
        if sigma > 0.0 && count >= min_count {
            return NoiseEstimate { sigma, layers: n };
        }
    }

    tracing::warn!(
        k_sigma = s0,
        "No convergence in MRS noise evaluation, using k-sigma noise estimate"
    );
    NoiseEstimate {
        sigma: s0,
        layers: 0,
    }
}

/// Signal to noise ratio `E(f^2) / sigma^2` over samples inside `(low, high)`.
pub fn snr(image: &[f32], noise: f64, low: f32, high: f32) -> f64 {
    let samples: Vec<f64> = image
        .iter()
        .filter(|&&v| v > low && v < high)
        .map(|&v| f64::from(v))
        .collect();
    mean_of_squares(&samples) / noise / noise
}
