//! Tests for robust estimators.

use super::*;
use crate::testing;

/// O(n^2) reference for Sn without the finite sample correction.
fn sn_reference(x: &[f64]) -> f64 {
    let n = x.len();
    let mut inner: Vec<f64> = x
        .iter()
        .map(|&xi| {
            let mut d: Vec<f64> = x.iter().map(|&xj| (xi - xj).abs()).collect();
            d.sort_by(f64::total_cmp);
            d[n / 2]
        })
        .collect();
    inner.sort_by(f64::total_cmp);
    inner[n.div_ceil(2) - 1]
}

/// O(n^2 log n) reference for Qn without the finite sample correction.
fn qn_reference(x: &[f64]) -> f64 {
    let n = x.len();
    let mut d = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            d.push((x[i] - x[j]).abs());
        }
    }
    d.sort_by(f64::total_cmp);
    let h = n / 2 + 1;
    d[h * (h - 1) / 2 - 1]
}

// ---------------------------------------------------------------------------
// Median and moments
// ---------------------------------------------------------------------------

#[test]
fn test_median_odd_and_even() {
    assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    assert_eq!(median(&[]), 0.0);
    assert_eq!(median_sorted(&[1.0, 2.0, 3.0, 10.0]), 2.5);
}

#[test]
fn test_std_dev_sample() {
    let s = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
    assert!((s - 2.138_089_935).abs() < 1e-8);
    assert_eq!(std_dev(&[1.0]), 0.0);
}

#[test]
fn test_avg_dev_and_mad() {
    let data = [1.0, 2.0, 3.0, 4.0, 100.0];
    let m = median(&data);
    assert_eq!(m, 3.0);
    assert!((avg_dev(&data, m) - (2.0 + 1.0 + 0.0 + 1.0 + 97.0) / 5.0).abs() < 1e-12);
    assert_eq!(mad(&data, m), 1.0);
}

#[test]
fn test_sample_in_range_is_open_interval() {
    let data = [0.0f32, 0.00002, 0.5, 0.99998, 1.0];
    let s = sample_in_range(&data, 0.00002, 0.99998);
    assert_eq!(s, vec![0.5]);
}

// ---------------------------------------------------------------------------
// Midvariances
// ---------------------------------------------------------------------------

#[test]
fn test_bwmv_of_gaussian_approximates_variance() {
    let mut rng = testing::rng(7);
    let data = testing::gaussian(&mut rng, 20_000, 0.3, 0.02);
    let m = median(&data);
    let s = biweight_midvariance(&data, m, mad(&data, m), BWMV_K).sqrt();
    assert!((s - 0.02).abs() < 0.001, "bwmv sigma {s}");
}

#[test]
fn test_bwmv_degenerate() {
    let data = [0.5; 10];
    assert_eq!(biweight_midvariance(&data, 0.5, 0.0, BWMV_K), 0.0);
}

#[test]
fn test_pbmv_positive_and_robust() {
    let mut rng = testing::rng(11);
    let mut data = testing::gaussian(&mut rng, 5_000, 0.2, 0.01);
    let m = median(&data);
    let clean = bend_midvariance(&data, m, PBMV_BETA).sqrt();
    for v in data.iter_mut().take(50) {
        *v = 0.95;
    }
    let dirty = bend_midvariance(&data, median(&data), PBMV_BETA).sqrt();
    assert!(clean > 0.0);
    assert!((dirty - clean).abs() / clean < 0.1);
}

#[test]
fn test_pbmv_small_samples_stay_in_bounds() {
    // (1 - beta) * n + 0.5 rounds up to n for two samples.
    assert_eq!(bend_midvariance(&[0.25, 0.75], 0.5, PBMV_BETA), 0.0);
    let v = bend_midvariance(&[0.25, 0.75, 0.625], 0.5, PBMV_BETA);
    assert!((v - 0.421875).abs() < 1e-12);
}

// ---------------------------------------------------------------------------
// Sn and Qn
// ---------------------------------------------------------------------------

#[test]
fn test_sn_matches_brute_force() {
    let mut rng = testing::rng(3);
    for n in [10usize, 11, 25, 64, 101] {
        let data = testing::gaussian(&mut rng, n, 0.5, 0.1);
        let cn = if n & 1 == 1 { n as f64 / (n as f64 - 0.9) } else { 1.0 };
        let expected = cn * sn_reference(&data);
        assert!((sn(&data) - expected).abs() < 1e-12, "n = {n}");
    }
}

#[test]
fn test_sn_small_samples() {
    let data = [0.1, 0.4, 0.2];
    assert!((sn(&data) - 1.851 * sn_reference(&data)).abs() < 1e-12);
    assert_eq!(sn(&[0.3]), 0.0);
}

#[test]
fn test_qn_matches_brute_force() {
    let mut rng = testing::rng(5);
    for n in [10usize, 13, 40, 77] {
        let data = testing::gaussian(&mut rng, n, 0.5, 0.1);
        let dn = if n & 1 == 1 {
            n as f64 / (n as f64 + 1.4)
        } else {
            n as f64 / (n as f64 + 3.8)
        };
        let expected = dn * qn_reference(&data);
        assert!((qn(&data) - expected).abs() < 1e-12, "n = {n}");
    }
}

#[test]
fn test_qn_with_ties() {
    let data = [0.5, 0.5, 0.5, 0.5, 0.5, 0.6, 0.7, 0.5, 0.5, 0.5];
    assert_eq!(qn(&data), 0.0);
}

// ---------------------------------------------------------------------------
// IKSS
// ---------------------------------------------------------------------------

#[test]
fn test_ikss_of_gaussian_approximates_sigma() {
    let mut rng = testing::rng(42);
    let plane = testing::gaussian_plane(&mut rng, 50_000, 0.25, 0.01);
    let est = ikss(&plane, 0.0, 1.0);
    assert!((est.location - 0.25).abs() < 0.001, "location {}", est.location);
    assert!((est.scale - 0.01).abs() < 0.0008, "scale {}", est.scale);
}

#[test]
fn test_ikss_resists_outliers() {
    let mut rng = testing::rng(43);
    let mut plane = testing::gaussian_plane(&mut rng, 20_000, 0.25, 0.01);
    for v in plane.iter_mut().step_by(50) {
        *v = 0.9;
    }
    let est = ikss(&plane, 0.0, 1.0);
    assert!((est.scale - 0.01).abs() < 0.0015, "scale {}", est.scale);
}

#[test]
fn test_ikss_constant_and_empty() {
    let est = ikss(&[0.5f32; 100], 0.0, 1.0);
    assert_eq!(est.location, 0.5);
    assert_eq!(est.scale, 0.0);
    assert_eq!(ikss(&[0.0f32; 10], 0.0, 1.0), LocationScale::default());
}
