//! Testing utilities for the integration crate.

#![allow(dead_code)]

use rand::prelude::*;

use crate::source::{MemoryOpener, MemoryRaster};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Gaussian samples via Box-Muller.
pub fn gaussian(rng: &mut StdRng, len: usize, mean: f64, sigma: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(len + 1);
    while out.len() < len {
        let u1: f64 = rng.random_range(1e-12f64..1.0);
        let u2: f64 = rng.random_range(0.0f64..1.0);
        let r = (-2.0 * u1.ln()).sqrt() * sigma;
        let theta = 2.0 * std::f64::consts::PI * u2;
        out.push(mean + r * theta.cos());
        out.push(mean + r * theta.sin());
    }
    out.truncate(len);
    out
}

/// Gaussian plane as `f32`.
pub fn gaussian_plane(rng: &mut StdRng, len: usize, mean: f64, sigma: f64) -> Vec<f32> {
    gaussian(rng, len, mean, sigma)
        .into_iter()
        .map(|v| v as f32)
        .collect()
}

/// Registers `planes` as single-channel rasters named `frame_{i}.fits`.
pub fn opener_from_planes(width: usize, height: usize, planes: Vec<Vec<f32>>) -> MemoryOpener {
    let mut opener = MemoryOpener::new();
    for (i, plane) in planes.into_iter().enumerate() {
        opener.insert(frame_path(i), MemoryRaster::new(width, height, vec![plane]));
    }
    opener
}

pub fn frame_path(index: usize) -> String {
    format!("frame_{index}.fits")
}

pub fn frame_paths(count: usize) -> Vec<String> {
    (0..count).map(frame_path).collect()
}

/// Initialize tracing subscriber for tests. Safe to call multiple times.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
