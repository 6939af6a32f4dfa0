//! Output rasters of an integration run and their identifiers.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::combination::OutputSample;

pub const INTEGRATION_ID: &str = "integration";
pub const LOW_REJECTION_MAP_ID: &str = "rejection_low";
pub const HIGH_REJECTION_MAP_ID: &str = "rejection_high";
pub const SLOPE_MAP_ID: &str = "slope";

/// Samples of an integrated image, one plane per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Planes {
    F32(Vec<Vec<f32>>),
    F64(Vec<Vec<f64>>),
}

impl Planes {
    /// Zero-filled planes, 64-bit if `wide`.
    pub fn new(channels: usize, pixels: usize, wide: bool) -> Self {
        if wide {
            Self::F64(vec![vec![0.0; pixels]; channels])
        } else {
            Self::F32(vec![vec![0.0; pixels]; channels])
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Self::F32(p) => p.len(),
            Self::F64(p) => p.len(),
        }
    }

    pub fn bits_per_sample(&self) -> u32 {
        match self {
            Self::F32(_) => 32,
            Self::F64(_) => 64,
        }
    }

    pub fn sample(&self, channel: usize, index: usize) -> f64 {
        match self {
            Self::F32(p) => f64::from(p[channel][index]),
            Self::F64(p) => p[channel][index],
        }
    }

    /// Plane `channel` in single precision, borrowed when already 32-bit.
    pub fn plane_f32(&self, channel: usize) -> Cow<'_, [f32]> {
        match self {
            Self::F32(p) => Cow::Borrowed(&p[channel]),
            Self::F64(p) => Cow::Owned(p[channel].iter().map(|&v| v as f32).collect()),
        }
    }

    /// Rescales all planes to `[0, 1]` if any sample lies outside that range.
    /// Returns whether samples changed.
    pub fn normalize(&mut self) -> bool {
        match self {
            Self::F32(p) => normalize_planes(p),
            Self::F64(p) => normalize_planes(p),
        }
    }
}

fn normalize_planes<T: OutputSample>(planes: &mut [Vec<T>]) -> bool {
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for v in planes.iter().flatten() {
        let v = v.to_f64();
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if lo >= 0.0 && hi <= 1.0 || lo > hi {
        return false;
    }

    let range = hi - lo;
    for v in planes.iter_mut().flatten() {
        let x = v.to_f64();
        *v = T::from_f64(if range > 0.0 {
            (x - lo) / range
        } else {
            x.clamp(0.0, 1.0)
        });
    }
    true
}

/// The integrated image.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRaster {
    pub id: String,
    pub width: usize,
    pub height: usize,
    pub is_color: bool,
    pub planes: Planes,
}

impl OutputRaster {
    pub fn channels(&self) -> usize {
        self.planes.channels()
    }

    pub fn sample(&self, channel: usize, x: usize, y: usize) -> f64 {
        self.planes.sample(channel, y * self.width + x)
    }
}

/// A single precision diagnostic raster: a rejection map or the slope map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapRaster {
    pub id: String,
    pub width: usize,
    pub height: usize,
    pub planes: Vec<Vec<f32>>,
}

impl MapRaster {
    pub fn new(id: String, width: usize, height: usize, channels: usize) -> Self {
        Self {
            id,
            width,
            height,
            planes: vec![vec![0.0; width * height]; channels],
        }
    }

    pub fn value(&self, channel: usize, x: usize, y: usize) -> f32 {
        self.planes[channel][y * self.width + x]
    }
}

/// Issues identifiers for output rasters.
///
/// An identifier already issued gets a numeric suffix (`integration1`,
/// `integration2`, ...) unless previous outputs are being replaced.
#[derive(Debug, Default)]
pub struct OutputIds {
    issued: HashMap<String, usize>,
}

impl OutputIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, base: &str, replace_previous: bool) -> String {
        let count = self.issued.entry(base.to_string()).or_insert(0);
        let id = if replace_previous || *count == 0 {
            *count = 0;
            base.to_string()
        } else {
            format!("{base}{count}")
        };
        *count += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Planes ==========

    #[test]
    fn test_planes_in_range_are_left_alone() {
        let mut planes = Planes::F32(vec![vec![0.0, 0.5, 1.0]]);
        assert!(!planes.normalize());
        assert_eq!(planes, Planes::F32(vec![vec![0.0, 0.5, 1.0]]));
    }

    #[test]
    fn test_normalize_rescales_over_all_channels() {
        let mut planes = Planes::F64(vec![vec![-0.5, 0.5], vec![1.5, 0.0]]);
        assert!(planes.normalize());
        assert_eq!(planes, Planes::F64(vec![vec![0.0, 0.5], vec![1.0, 0.25]]));
    }

    #[test]
    fn test_normalize_constant_out_of_range() {
        let mut planes = Planes::F32(vec![vec![2.0; 3]]);
        assert!(planes.normalize());
        assert_eq!(planes, Planes::F32(vec![vec![1.0; 3]]));
    }

    #[test]
    fn test_plane_f32_views() {
        let planes = Planes::new(2, 3, true);
        assert_eq!(planes.bits_per_sample(), 64);
        assert_eq!(planes.channels(), 2);
        assert!(matches!(planes.plane_f32(1), Cow::Owned(_)));
        let planes = Planes::new(1, 3, false);
        assert!(matches!(planes.plane_f32(0), Cow::Borrowed(_)));
    }

    // ========== Ids ==========

    #[test]
    fn test_ids_get_numeric_suffixes() {
        let mut ids = OutputIds::new();
        assert_eq!(ids.allocate(INTEGRATION_ID, false), "integration");
        assert_eq!(ids.allocate(INTEGRATION_ID, false), "integration1");
        assert_eq!(ids.allocate(SLOPE_MAP_ID, false), "slope");
        assert_eq!(ids.allocate(INTEGRATION_ID, false), "integration2");
    }

    #[test]
    fn test_replacing_previous_reuses_ids() {
        let mut ids = OutputIds::new();
        assert_eq!(ids.allocate(LOW_REJECTION_MAP_ID, true), "rejection_low");
        assert_eq!(ids.allocate(LOW_REJECTION_MAP_ID, true), "rejection_low");
        assert_eq!(ids.allocate(HIGH_REJECTION_MAP_ID, false), "rejection_high");
    }
}
