use super::*;
use crate::testing;

// ========== Transform ==========

#[test]
fn test_mirror_indices() {
    assert_eq!(mirror(-1, 5), 1);
    assert_eq!(mirror(-2, 5), 2);
    assert_eq!(mirror(5, 5), 3);
    assert_eq!(mirror(6, 5), 2);
    assert_eq!(mirror(3, 5), 3);
    assert_eq!(mirror(-16, 3), 0);
    assert_eq!(mirror(7, 1), 0);
}

#[test]
fn test_transform_reconstructs_image() {
    let mut rng = testing::rng(1);
    let (w, h) = (37, 23);
    let image = testing::gaussian_plane(&mut rng, w * h, 0.3, 0.05);
    let t = WaveletTransform::new(&image, w, h, 4);
    assert_eq!(t.layers.len(), 4);
    for i in 0..image.len() {
        let sum: f32 = t.layers.iter().map(|l| l[i]).sum::<f32>() + t.residual[i];
        assert!((sum - image[i]).abs() < 1e-5);
    }
}

#[test]
fn test_truncated_residual() {
    let mut rng = testing::rng(2);
    let image = testing::gaussian_plane(&mut rng, 16 * 16, 0.3, 0.05);
    let t = WaveletTransform::new(&image, 16, 16, 4);
    let r2 = t.residual_at(2);
    for i in 0..image.len() {
        let sum = t.layers[0][i] + t.layers[1][i] + r2[i];
        assert!((sum - image[i]).abs() < 1e-5);
    }
}

#[test]
fn test_constant_image_has_flat_layers() {
    let image = vec![0.4f32; 20 * 20];
    let t = WaveletTransform::new(&image, 20, 20, 3);
    for layer in &t.layers {
        assert!(layer.iter().all(|v| v.abs() < 1e-6));
    }
    assert!(t.residual.iter().all(|v| (v - 0.4).abs() < 1e-6));
}

// ========== Estimators ==========

#[test]
fn test_k_sigma_on_first_layer() {
    let mut rng = testing::rng(3);
    let (w, h) = (128, 128);
    let image = testing::gaussian_plane(&mut rng, w * h, 0.2, 0.01);
    let t = WaveletTransform::new(&image, w, h, 1);
    let s = noise_k_sigma(&t.layers[0], &image, NOISE_LOW, NOISE_HIGH, 3.0, 0.01, 10)
        / B3_NOISE_SCALING[0];
    assert!((s - 0.01).abs() < 0.001, "k-sigma {s}");
}

#[test]
fn test_mrs_noise_of_white_gaussian_noise() {
    let mut rng = testing::rng(4);
    let (w, h) = (256, 256);
    let image = testing::gaussian_plane(&mut rng, w * h, 0.2, 0.01);
    let est = evaluate_noise(&image, w, h, 0.01);
    assert!(est.layers >= 2, "fell back to k-sigma");
    assert!((est.sigma - 0.01).abs() < 0.001, "mrs {}", est.sigma);
}

#[test]
fn test_mrs_ignores_smooth_structure() {
    let mut rng = testing::rng(5);
    let (w, h) = (192, 192);
    let mut image = testing::gaussian_plane(&mut rng, w * h, 0.1, 0.005);
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - 96.0;
            let dy = y as f32 - 96.0;
            image[y * w + x] += 0.3 * (-(dx * dx + dy * dy) / 200.0).exp();
        }
    }
    let est = evaluate_noise(&image, w, h, 0.01);
    assert!((est.sigma - 0.005).abs() < 0.001, "mrs {}", est.sigma);
}

#[test]
fn test_noise_of_blank_image_falls_back_to_zero() {
    let image = vec![0.0f32; 32 * 32];
    let est = evaluate_noise(&image, 32, 32, 0.01);
    assert_eq!(est.layers, 0);
    assert_eq!(est.sigma, 0.0);
}

#[test]
fn test_snr() {
    let image = vec![0.5f32; 100];
    assert!((snr(&image, 0.01, 0.0, 0.85) - 2500.0).abs() < 1e-6);
    // Samples above the high limit are ignored.
    let mut bright = image.clone();
    bright[0] = 0.9;
    assert!((snr(&bright, 0.01, 0.0, 0.85) - 2500.0).abs() < 1e-6);
}
