//! Statistical rejection of a single pixel stack.
//!
//! Every function works on the first `n` entries of a stack (the kept ones),
//! flags outliers, keeps the stack sorted with kept entries first and returns
//! the new kept count.

use common::float_ext::FloatExt;

use crate::math::LinearFit;
use crate::math::statistics::std_dev;
use crate::stack::{PixelStackEntry, sort_by_value};

/// Huber's constant for Winsorization boundaries.
const HUBER_C: f64 = 1.5;
/// Bias correction factor for Winsorized standard deviation.
const WINSORIZED_CORRECTION: f64 = 1.134;
/// Convergence threshold for iterative Winsorization.
const WINSORIZE_CONVERGENCE: f64 = 0.0005;
/// Maximum iterations for Winsorization convergence.
const WINSORIZE_MAX_ITER: u32 = 50;

/// Slope beyond which the fitted trend counts as vertical.
const MAX_SLOPE: f64 = 1.0e7;

/// Full well of the CCD noise model, in DN.
const CCD_BITS: i32 = 16;

/// Sides of the distribution a rejection may flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipSides {
    pub low: bool,
    pub high: bool,
}

/// Reusable per-worker buffers.
#[derive(Debug, Default)]
pub struct Scratch {
    a: Vec<f64>,
    b: Vec<f64>,
}

// ============================================================================
// Stack statistics
// ============================================================================

/// Median of sorted entries. Stacks of fewer than 2 entries yield 0.
pub fn rejection_median(stack: &[PixelStackEntry]) -> f64 {
    let n = stack.len();
    if n < 2 {
        return 0.0;
    }
    let n2 = n / 2;
    if n & 1 == 1 {
        f64::from(stack[n2].value)
    } else {
        (f64::from(stack[n2].value) + f64::from(stack[n2 - 1].value)) / 2.0
    }
}

/// Sample standard deviation of entry values. Stacks of fewer than 2 entries
/// yield 0.
pub fn rejection_sigma(stack: &[PixelStackEntry]) -> f64 {
    let n = stack.len();
    if n < 2 {
        return 0.0;
    }
    let mean = stack.iter().map(|e| f64::from(e.value)).sum::<f64>() / n as f64;
    let (mut var, mut eps) = (0.0, 0.0);
    for e in stack {
        let d = f64::from(e.value) - mean;
        var += d * d;
        eps += d;
    }
    ((var - eps * eps / n as f64) / (n - 1) as f64).sqrt()
}

/// Huber-type robust `(mean, sigma)` of sorted entries.
///
/// The mean is the median; sigma is refined by clamping the sample to
/// `mean ± 1.5 sigma` until it changes by less than 0.05%.
pub fn winsorization(stack: &[PixelStackEntry], scratch: &mut Vec<f64>) -> (f64, f64) {
    if stack.len() < 2 {
        return (0.0, 0.0);
    }
    let mean = rejection_median(stack);
    let mut sigma = rejection_sigma(stack);

    scratch.clear();
    scratch.extend(stack.iter().map(|e| f64::from(e.value)));

    for it in 1..=WINSORIZE_MAX_ITER {
        if sigma.is_insignificant() {
            break;
        }
        let t0 = mean - HUBER_C * sigma;
        let t1 = mean + HUBER_C * sigma;
        for v in scratch.iter_mut() {
            *v = v.clamp(t0, t1);
        }
        let s0 = sigma;
        sigma = WINSORIZED_CORRECTION * std_dev(scratch);
        if it > 1 && (s0 - sigma).abs() / s0 < WINSORIZE_CONVERGENCE {
            break;
        }
    }
    (mean, sigma)
}

/// Flags entries beyond `low`/`high` multiples of `sigma` from `center`,
/// scanning inward from both extremes of the sorted stack. Returns the number
/// of new flags.
fn clip_about(
    stack: &mut [PixelStackEntry],
    center: f64,
    sigma: f64,
    low: f64,
    high: f64,
    sides: ClipSides,
) -> usize {
    let mut nc = 0;
    if sides.low {
        for e in stack.iter_mut() {
            if (center - f64::from(e.value)) / sigma <= low {
                break;
            }
            e.reject_low = true;
            nc += 1;
        }
    }
    if sides.high {
        for e in stack.iter_mut().rev() {
            if (f64::from(e.value) - center) / sigma <= high {
                break;
            }
            e.reject_high = true;
            nc += 1;
        }
    }
    nc
}

// ============================================================================
// Algorithms
// ============================================================================

/// Unconditionally flags the `low` lowest and `high` highest entries.
pub fn min_max(
    stack: &mut [PixelStackEntry],
    n: usize,
    low: usize,
    high: usize,
    sides: ClipSides,
) -> usize {
    if n < 1 {
        return n;
    }
    let nl = if sides.low { low.min(n) } else { 0 };
    let nh = if sides.high { high.min(n) } else { 0 };
    if nl == 0 && nh == 0 {
        return n;
    }

    let r = &mut stack[..n];
    sort_by_value(r);
    for e in &mut r[..nl] {
        e.reject_low = true;
    }
    for e in &mut r[n - nh..] {
        e.reject_high = true;
    }
    sort_by_value(r);
    n - n.min(nl + nh)
}

/// Flags entries whose distance from the median, relative to the median,
/// exceeds `low` below or `high` above it.
pub fn percentile(
    stack: &mut [PixelStackEntry],
    n: usize,
    low: f64,
    high: f64,
    sides: ClipSides,
) -> usize {
    if n < 2 {
        return n;
    }
    let r = &mut stack[..n];
    sort_by_value(r);
    let median = rejection_median(r);
    if median.is_insignificant() {
        return n;
    }

    let mut nc = 0;
    if sides.low {
        for e in r.iter_mut() {
            if (median - f64::from(e.value)) / median <= low {
                break;
            }
            e.reject_low = true;
            nc += 1;
        }
    }
    if sides.high {
        for e in r.iter_mut().rev() {
            if (f64::from(e.value) - median) / median <= high {
                break;
            }
            e.reject_high = true;
            nc += 1;
        }
    }
    if nc > 0 {
        sort_by_value(r);
    }
    n - nc
}

/// Iterative sigma clipping about the median.
pub fn sigma_clip(
    stack: &mut [PixelStackEntry],
    mut n: usize,
    low: f64,
    high: f64,
    sides: ClipSides,
) -> usize {
    if n < 3 {
        return n;
    }
    sort_by_value(&mut stack[..n]);
    loop {
        let r = &mut stack[..n];
        let sigma = rejection_sigma(r);
        if sigma.is_insignificant() {
            break;
        }
        let median = rejection_median(r);
        let nc = clip_about(r, median, sigma, low, high, sides);
        if nc == 0 {
            break;
        }
        sort_by_value(r);
        n -= nc;
        if n < 3 {
            break;
        }
    }
    n
}

/// Iterative sigma clipping about the Winsorized mean, with the Winsorized
/// sigma.
pub fn winsorized_sigma_clip(
    stack: &mut [PixelStackEntry],
    mut n: usize,
    low: f64,
    high: f64,
    sides: ClipSides,
    scratch: &mut Scratch,
) -> usize {
    if n < 3 {
        return n;
    }
    sort_by_value(&mut stack[..n]);
    loop {
        let r = &mut stack[..n];
        let (mean, sigma) = winsorization(r, &mut scratch.a);
        if sigma.is_insignificant() {
            break;
        }
        let nc = clip_about(r, mean, sigma, low, high, sides);
        if nc == 0 {
            break;
        }
        sort_by_value(r);
        n -= nc;
        if n < 3 {
            break;
        }
    }
    n
}

/// Sigma clipping with a Poisson noise model: sigma is proportional to the
/// square root of the current median, with the proportionality estimated
/// once from the initial kept entries.
///
/// A stack whose initial median vanishes is left with no kept entries.
pub fn averaged_sigma_clip(
    stack: &mut [PixelStackEntry],
    mut n: usize,
    low: f64,
    high: f64,
    sides: ClipSides,
) -> usize {
    if n < 3 {
        return n;
    }
    sort_by_value(&mut stack[..n]);
    let mut median = rejection_median(&stack[..n]);
    if median.is_insignificant() {
        return 0;
    }
    let acc: f64 = stack[..n]
        .iter()
        .map(|e| {
            let d = f64::from(e.value) - median;
            d * d / median
        })
        .sum();
    let s = (acc / (n - 1) as f64).sqrt();

    loop {
        let sigma = s * median.sqrt();
        if sigma.is_insignificant() || !sigma.is_finite() {
            break;
        }
        let r = &mut stack[..n];
        let nc = clip_about(r, median, sigma, low, high, sides);
        if nc == 0 {
            break;
        }
        sort_by_value(r);
        n -= nc;
        if n < 3 {
            break;
        }
        median = rejection_median(&stack[..n]);
    }
    n
}

/// Clipping about a straight line fitted to the sorted stack against rank.
///
/// The tolerance unit is twice the mean absolute deviation of the fit. On
/// convergence `slope` receives `atan(b) / (pi/4)` for positive slopes `b`, 0
/// otherwise. A degenerate fit rejects the whole stack.
pub fn linear_fit_clip(
    stack: &mut [PixelStackEntry],
    mut n: usize,
    low: f64,
    high: f64,
    sides: ClipSides,
    slope: &mut f32,
    scratch: &mut Scratch,
) -> usize {
    if n < 5 {
        return n;
    }
    sort_by_value(&mut stack[..n]);
    loop {
        let r = &mut stack[..n];
        scratch.a.clear();
        scratch.a.extend((0..n).map(|j| j as f64));
        scratch.b.clear();
        scratch.b.extend(r.iter().map(|e| f64::from(e.value)));

        let Some(fit) = LinearFit::fit(&scratch.a, &scratch.b) else {
            for e in r.iter_mut() {
                e.reject_low = true;
                e.reject_high = true;
            }
            *slope = 0.0;
            return 0;
        };

        let sigma = 2.0 * fit.adev;
        if sigma.is_insignificant() {
            break;
        }

        let mut nc = 0;
        for (j, e) in r.iter_mut().enumerate() {
            let y = fit.eval(j as f64);
            let v = f64::from(e.value);
            if v < y {
                if sides.low && (y - v) / sigma >= low {
                    e.reject_low = true;
                    nc += 1;
                }
            } else if sides.high && (v - y) / sigma >= high {
                e.reject_high = true;
                nc += 1;
            }
        }

        if nc == 0 {
            // Roundoff can leave an insignificant negative slope.
            *slope = if fit.b > 0.0 {
                if fit.b < MAX_SLOPE {
                    (fit.b.atan() / std::f64::consts::FRAC_PI_4) as f32
                } else {
                    1.0
                }
            } else {
                0.0
            };
            break;
        }

        sort_by_value(r);
        n -= nc;
        if n < 3 {
            break;
        }
    }
    n
}

/// Noise model of a CCD sensor, expressed in normalized `[0, 1]` units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcdModel {
    r2g2: f64,
    gk: f64,
    sn2: f64,
}

impl CcdModel {
    /// `gain` in e-/DN, `read_noise` in e-, `scale_noise` as a fraction.
    pub fn new(gain: f32, read_noise: f32, scale_noise: f32) -> Self {
        let full = 2f64.powi(CCD_BITS) - 1.0;
        let rg = f64::from(read_noise) / f64::from(gain);
        Self {
            r2g2: rg * rg / full,
            gk: 1.0 / f64::from(gain) / full,
            sn2: f64::from(scale_noise) * f64::from(scale_noise) / full,
        }
    }

    /// Expected standard deviation of a pixel at level `median`.
    pub fn sigma(&self, median: f64) -> f64 {
        let mut variance = self.r2g2 + self.gk * median;
        if self.sn2 != 0.0 {
            variance += self.sn2 * median * median;
        }
        variance.sqrt()
    }
}

/// Sigma clipping about the median with sigma from the CCD noise model.
pub fn ccd_clip(
    stack: &mut [PixelStackEntry],
    mut n: usize,
    model: &CcdModel,
    low: f64,
    high: f64,
    sides: ClipSides,
) -> usize {
    if n < 2 {
        return n;
    }
    sort_by_value(&mut stack[..n]);
    loop {
        let r = &mut stack[..n];
        let median = rejection_median(r);
        let sigma = model.sigma(median);
        let nc = clip_about(r, median, sigma, low, high, sides);
        if nc == 0 {
            break;
        }
        sort_by_value(r);
        n -= nc;
        if n < 2 {
            break;
        }
    }
    n
}
