//! Robust straight-line fit minimizing the sum of absolute deviations.

use super::statistics::median_mut;

const ROFUNC_EPS: f64 = 1.0e-7;

/// Line `y = a + b*x` fitted to a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub a: f64,
    pub b: f64,
    /// Mean absolute deviation of the sample from the fitted line.
    pub adev: f64,
}

impl LinearFit {
    /// Least absolute deviation fit of `y` against `x`.
    ///
    /// Starts from the least squares solution and brackets the slope at which
    /// the derivative of the absolute deviation sum changes sign, then bisects.
    /// Returns `None` for fewer than two points or a non-finite result.
    pub fn fit(x: &[f64], y: &[f64]) -> Option<Self> {
        let n = x.len().min(y.len());
        if n < 2 {
            return None;
        }
        let (x, y) = (&x[..n], &y[..n]);
        let nf = n as f64;

        let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
        for (&xi, &yi) in x.iter().zip(y) {
            sx += xi;
            sy += yi;
            sxy += xi * yi;
            sxx += xi * xi;
        }
        let del = nf * sxx - sx * sx;
        if del == 0.0 || !del.is_finite() {
            return None;
        }

        let mut aa = (sxx * sy - sx * sxy) / del;
        let mut bb = (nf * sxy - sx * sy) / del;

        let chisq: f64 = x
            .iter()
            .zip(y)
            .map(|(&xi, &yi)| {
                let d = yi - (aa + bb * xi);
                d * d
            })
            .sum();
        let mut sigb = (chisq / del).sqrt();

        let mut scratch = vec![0.0; n];
        let mut abdev = 0.0;
        let mut b1 = bb;
        let mut f1 = rofunc(b1, x, y, &mut scratch, &mut aa, &mut abdev);

        if sigb > 0.0 {
            let mut b2 = bb + (3.0 * sigb).copysign(f1);
            let mut f2 = rofunc(b2, x, y, &mut scratch, &mut aa, &mut abdev);
            if b2 == b1 {
                return Self::checked(aa, bb, abdev / nf);
            }

            let mut guard = 0;
            while f1 * f2 > 0.0 {
                bb = b2 + 1.6 * (b2 - b1);
                b1 = b2;
                f1 = f2;
                b2 = bb;
                f2 = rofunc(b2, x, y, &mut scratch, &mut aa, &mut abdev);
                guard += 1;
                if guard > 100 || !b2.is_finite() {
                    return None;
                }
            }

            sigb *= 0.01;
            while (b2 - b1).abs() > sigb {
                bb = b1 + 0.5 * (b2 - b1);
                if bb == b1 || bb == b2 {
                    break;
                }
                let f = rofunc(bb, x, y, &mut scratch, &mut aa, &mut abdev);
                if f * f1 >= 0.0 {
                    f1 = f;
                    b1 = bb;
                } else {
                    f2 = f;
                    b2 = bb;
                }
            }
        }

        Self::checked(aa, bb, abdev / nf)
    }

    fn checked(a: f64, b: f64, adev: f64) -> Option<Self> {
        (a.is_finite() && b.is_finite() && adev.is_finite()).then_some(Self { a, b, adev })
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.a + self.b * x
    }
}

/// Derivative sign sum of the absolute deviation for slope `b`. Updates the
/// intercept `aa` (median of `y - b*x`) and the total absolute deviation.
fn rofunc(
    b: f64,
    x: &[f64],
    y: &[f64],
    scratch: &mut [f64],
    aa: &mut f64,
    abdev: &mut f64,
) -> f64 {
    for ((s, &xi), &yi) in scratch.iter_mut().zip(x).zip(y) {
        *s = yi - b * xi;
    }
    *aa = median_mut(scratch);

    let mut sum = 0.0;
    *abdev = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        let mut d = yi - (b * xi + *aa);
        *abdev += d.abs();
        if yi != 0.0 {
            d /= yi.abs();
        }
        if d.abs() > ROFUNC_EPS {
            sum += if d >= 0.0 { xi } else { -xi };
        }
    }
    sum
}
