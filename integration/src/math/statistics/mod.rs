//! Robust estimators of location and scale.
//!
//! Scale estimators are returned unnormalized: MAD, average deviation, Sn and
//! Qn are not multiplied by their Gaussian consistency constants, and the
//! midvariances are variances (take the square root for a scale).

#[cfg(test)]
mod tests;

/// Default biweight midvariance rejection limit in sigma units.
pub const BWMV_K: f64 = 9.0;

/// Default percentage bend midvariance rejection parameter.
pub const PBMV_BETA: f64 = 0.2;

/// Clipping factor of the IKSS estimator.
pub const IKSS_K: f64 = 4.0;

/// Makes IKSS consistent with the standard deviation of a normal distribution.
pub const IKSS_NORMAL: f64 = 0.991;

/// Relative accuracy at which IKSS iterations stop.
pub const IKSS_ACCURACY: f64 = 1.0e-6;

/// Robust location and scale of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocationScale {
    pub location: f64,
    pub scale: f64,
}

/// Collects the samples strictly inside `(low, high)` as `f64`.
pub fn sample_in_range(data: &[f32], low: f64, high: f64) -> Vec<f64> {
    data.iter()
        .map(|&v| f64::from(v))
        .filter(|&v| v > low && v < high)
        .collect()
}

/// Median of `data`, reordering it. Even counts average the two middle values.
pub fn median_mut(data: &mut [f64]) -> f64 {
    let len = data.len();
    if len == 0 {
        return 0.0;
    }
    let mid = len / 2;
    let (left, median, _) = data.select_nth_unstable_by(mid, f64::total_cmp);
    let right = *median;
    if len & 1 == 1 {
        right
    } else {
        let left = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (left + right) * 0.5
    }
}

/// Median of an already sorted slice.
pub fn median_sorted(sorted: &[f64]) -> f64 {
    let len = sorted.len();
    if len == 0 {
        return 0.0;
    }
    let mid = len / 2;
    if len & 1 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    }
}

pub fn median(data: &[f64]) -> f64 {
    median_mut(&mut data.to_vec())
}

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Sample standard deviation (n - 1), two-pass with roundoff correction.
pub fn std_dev(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(data);
    let (mut var, mut eps) = (0.0, 0.0);
    for &x in data {
        let d = x - m;
        var += d * d;
        eps += d;
    }
    ((var - eps * eps / n as f64) / (n - 1) as f64).max(0.0).sqrt()
}

/// Mean of squared values.
pub fn mean_of_squares(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|x| x * x).sum::<f64>() / data.len() as f64
}

/// Average absolute deviation from `center`.
pub fn avg_dev(data: &[f64], center: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    data.iter().map(|x| (x - center).abs()).sum::<f64>() / data.len() as f64
}

/// Median absolute deviation from `center`.
pub fn mad(data: &[f64], center: f64) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let mut deviations: Vec<f64> = data.iter().map(|x| (x - center).abs()).collect();
    median_mut(&mut deviations)
}

/// Biweight midvariance about `center`, with `sigma` a reference dispersion
/// (normally the MAD) and `k` the rejection limit in sigma units.
pub fn biweight_midvariance(data: &[f64], center: f64, sigma: f64, k: f64) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let kd = k * sigma;
    if kd < 0.0 || 1.0 + kd == 1.0 {
        return 0.0;
    }

    let (mut num, mut den) = (0.0, 0.0);
    for &x in data {
        let xc = x - center;
        let y = xc / kd;
        if y.abs() < 1.0 {
            let y2 = y * y;
            let y21 = 1.0 - y2;
            num += xc * xc * y21 * y21 * y21 * y21;
            den += y21 * (1.0 - 5.0 * y2);
        }
    }

    den *= den;
    if 1.0 + den == 1.0 {
        return 0.0;
    }
    n as f64 * num / den
}

/// Percentage bend midvariance about `center`.
pub fn bend_midvariance(data: &[f64], center: f64, beta: f64) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let beta = beta.clamp(0.0, 0.5);
    let m = (((1.0 - beta) * n as f64 + 0.5).floor() as usize).min(n - 1);

    let mut w: Vec<f64> = data.iter().map(|x| (x - center).abs()).collect();
    let (_, wb, _) = w.select_nth_unstable_by(m, f64::total_cmp);
    let wb = *wb;
    if 1.0 + wb == 1.0 {
        return 0.0;
    }

    let mut num = 0.0;
    let mut den = 0usize;
    for &x in data {
        let y = (x - center) / wb;
        let f = y.clamp(-1.0, 1.0);
        num += f * f;
        if y.abs() < 1.0 {
            den += 1;
        }
    }
    if den == 0 {
        return 0.0;
    }
    let den = den as f64;
    n as f64 * wb * wb * num / den / den
}

/// Rousseeuw-Croux Sn estimator: `lomed_i himed_j |x_i - x_j|` with the
/// finite sample correction, without the 1.1926 consistency constant.
///
/// For each sorted sample the high median of its distances to all samples is
/// the k-th smallest element of two monotone sequences, found by bisection.
pub fn sn(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let mut x = data.to_vec();
    x.sort_unstable_by(f64::total_cmp);

    // Rank n/2 + 1 among n distances, the first of which is the zero self
    // distance, i.e. index n/2 - 1 among the other n - 1.
    let k = n / 2 - 1;
    let mut a2: Vec<f64> = (0..n)
        .map(|i| {
            let left = |t: usize| x[i] - x[i - 1 - t];
            let right = |t: usize| x[i + 1 + t] - x[i];
            kth_of_two_sorted(i, left, n - 1 - i, right, k)
        })
        .collect();

    let cn = match n {
        2 => 0.743,
        3 => 1.851,
        4 => 0.954,
        5 => 1.351,
        6 => 0.993,
        7 => 1.198,
        8 => 1.005,
        9 => 1.131,
        _ if n & 1 == 1 => n as f64 / (n as f64 - 0.9),
        _ => 1.0,
    };

    let nh = n.div_ceil(2);
    let (_, lomed, _) = a2.select_nth_unstable_by(nh - 1, f64::total_cmp);
    cn * *lomed
}

/// k-th smallest (0-based) element of the union of two ascending sequences.
fn kth_of_two_sorted(
    a_len: usize,
    a: impl Fn(usize) -> f64,
    b_len: usize,
    b: impl Fn(usize) -> f64,
    k: usize,
) -> f64 {
    debug_assert!(k < a_len + b_len);
    let take = k + 1;
    let mut lo = take.saturating_sub(b_len);
    let mut hi = take.min(a_len);
    loop {
        let i = lo + (hi - lo) / 2;
        let j = take - i;
        if i < a_len && j > 0 && b(j - 1) > a(i) {
            lo = i + 1;
        } else if i > 0 && j < b_len && a(i - 1) > b(j) {
            hi = i - 1;
        } else {
            let from_a = if i > 0 { a(i - 1) } else { f64::NEG_INFINITY };
            let from_b = if j > 0 { b(j - 1) } else { f64::NEG_INFINITY };
            return from_a.max(from_b);
        }
    }
}

/// Rousseeuw-Croux Qn estimator: the `C(h, 2)`-th smallest pairwise distance
/// with `h = n/2 + 1`, with the finite sample correction, without the 2.2219
/// consistency constant.
///
/// The order statistic is located by bisection on the distance value with a
/// linear-time count of pairs below each trial value.
pub fn qn(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let mut x = data.to_vec();
    x.sort_unstable_by(f64::total_cmp);

    let h = n / 2 + 1;
    let k = h * (h - 1) / 2;

    let q = if count_pairs_within(&x, 0.0) >= k {
        0.0
    } else {
        let mut lo = 0.0;
        let mut hi = x[n - 1] - x[0];
        for _ in 0..200 {
            let mid = lo + (hi - lo) * 0.5;
            if mid <= lo || mid >= hi {
                break;
            }
            if count_pairs_within(&x, mid) >= k {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        largest_pair_distance_within(&x, hi)
    };

    let dn = match n {
        2 => 0.399,
        3 => 0.994,
        4 => 0.512,
        5 => 0.844,
        6 => 0.611,
        7 => 0.857,
        8 => 0.669,
        9 => 0.872,
        _ if n & 1 == 1 => n as f64 / (n as f64 + 1.4),
        _ => n as f64 / (n as f64 + 3.8),
    };
    dn * q
}

/// Number of pairs `i < j` of sorted `x` with `x[j] - x[i] <= t`.
fn count_pairs_within(x: &[f64], t: f64) -> usize {
    let mut count = 0;
    let mut i = 0;
    for j in 0..x.len() {
        while x[j] - x[i] > t {
            i += 1;
        }
        count += j - i;
    }
    count
}

/// Largest pairwise distance of sorted `x` not exceeding `t`.
fn largest_pair_distance_within(x: &[f64], t: f64) -> f64 {
    let mut best = 0.0f64;
    let mut i = 0;
    for j in 1..x.len() {
        while x[j] - x[i] > t {
            i += 1;
        }
        if i < j {
            best = best.max(x[j] - x[i]);
        }
    }
    best
}

/// Iterative k-sigma / biweight midvariance estimator of location and scale.
///
/// Samples outside `(low, high)` are ignored. Each iteration computes the
/// median and `sqrt(BWMV)` of the remaining samples, then trims them to
/// `median ± 4 sigma`, until the scale changes by less than one part in a
/// million.
pub fn ikss(data: &[f32], low: f64, high: f64) -> LocationScale {
    let mut a = sample_in_range(data, low, high);
    a.sort_unstable_by(f64::total_cmp);
    ikss_sorted(&a)
}

/// [`ikss`] on an ascending sample.
pub fn ikss_sorted(sorted: &[f64]) -> LocationScale {
    let mut i = 0;
    let mut j = sorted.len();
    let mut s0 = 1.0;
    loop {
        if j <= i {
            return LocationScale::default();
        }
        let window = &sorted[i..j];
        let m = median_sorted(window);
        let s = biweight_midvariance(window, m, mad(window, m), BWMV_K).sqrt();
        if 1.0 + s == 1.0 {
            return LocationScale {
                location: m,
                scale: 0.0,
            };
        }
        if (s0 - s) / s0 < IKSS_ACCURACY {
            return LocationScale {
                location: m,
                scale: IKSS_NORMAL * s,
            };
        }
        s0 = s;

        let v0 = m - IKSS_K * s;
        let v1 = m + IKSS_K * s;
        while i < j && sorted[i] < v0 {
            i += 1;
        }
        while j > i && sorted[j - 1] > v1 {
            j -= 1;
        }
    }
}
