//! Source raster abstraction.
//!
//! Decoding image files is left to the caller: the engine only needs to know
//! the geometry of a file, read rows of one channel as `f32`, and look up
//! numeric metadata fields.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Geometry of a source raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub is_color: bool,
}

impl RasterInfo {
    /// Width, height and channel count match. The color flag is not compared.
    pub fn same_geometry(&self, other: &RasterInfo) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }
}

/// An opened source image.
pub trait SourceRaster: Send + Sync {
    fn info(&self) -> RasterInfo;

    /// Human readable name of the underlying file format.
    fn format_name(&self) -> &str;

    /// Whether rows can be read on demand. Non-incremental rasters are read
    /// once in full when opened.
    fn can_read_incrementally(&self) -> bool;

    fn can_store_keywords(&self) -> bool {
        true
    }

    /// Exposure time supplied out of band (e.g. format hints), if any.
    fn exposure(&self) -> Option<f64> {
        None
    }

    /// Reads `buffer.len() / width` full-width rows of `channel`, starting at
    /// `start_row`.
    fn read_rows(&mut self, channel: usize, start_row: usize, buffer: &mut [f32])
    -> io::Result<()>;

    /// Case-insensitive lookup of a numeric metadata field.
    fn keyword(&self, name: &str) -> Option<f64>;
}

/// Opens source rasters by path.
pub trait RasterOpener: Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn SourceRaster>>;
}

// ============================================================================
// In-memory rasters
// ============================================================================

/// A raster held entirely in memory, one `f32` plane per channel.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    info: RasterInfo,
    planes: Vec<Vec<f32>>,
    keywords: HashMap<String, f64>,
    incremental: bool,
    exposure: Option<f64>,
}

impl MemoryRaster {
    /// # Panics
    ///
    /// Panics if `planes` is empty or a plane does not hold `width * height` samples.
    pub fn new(width: usize, height: usize, planes: Vec<Vec<f32>>) -> Self {
        assert!(!planes.is_empty(), "A raster needs at least one channel");
        for plane in &planes {
            assert_eq!(
                plane.len(),
                width * height,
                "Plane size must match {width}x{height}"
            );
        }
        let channels = planes.len();
        Self {
            info: RasterInfo {
                width,
                height,
                channels,
                is_color: channels == 3,
            },
            planes,
            keywords: HashMap::new(),
            incremental: true,
            exposure: None,
        }
    }

    pub fn constant(width: usize, height: usize, channels: usize, value: f32) -> Self {
        Self::new(width, height, vec![vec![value; width * height]; channels])
    }

    pub fn with_keyword(mut self, name: &str, value: f64) -> Self {
        self.keywords.insert(name.to_ascii_uppercase(), value);
        self
    }

    pub fn with_exposure(mut self, seconds: f64) -> Self {
        self.exposure = Some(seconds);
        self
    }

    pub fn non_incremental(mut self) -> Self {
        self.incremental = false;
        self
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }
}

impl SourceRaster for MemoryRaster {
    fn info(&self) -> RasterInfo {
        self.info
    }

    fn format_name(&self) -> &str {
        "memory"
    }

    fn can_read_incrementally(&self) -> bool {
        self.incremental
    }

    fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    fn read_rows(
        &mut self,
        channel: usize,
        start_row: usize,
        buffer: &mut [f32],
    ) -> io::Result<()> {
        let width = self.info.width;
        let plane = self.planes.get(channel).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel {channel} out of range"),
            )
        })?;
        let start = start_row * width;
        let end = start + buffer.len();
        if buffer.len() % width != 0 || end > plane.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "rows {start_row}..{} out of range",
                    start_row + buffer.len() / width
                ),
            ));
        }
        buffer.copy_from_slice(&plane[start..end]);
        Ok(())
    }

    fn keyword(&self, name: &str) -> Option<f64> {
        self.keywords.get(&name.to_ascii_uppercase()).copied()
    }
}

/// Serves [`MemoryRaster`]s registered under file paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryOpener {
    rasters: HashMap<PathBuf, MemoryRaster>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, raster: MemoryRaster) {
        self.rasters.insert(path.into(), raster);
    }

    pub fn with(mut self, path: impl Into<PathBuf>, raster: MemoryRaster) -> Self {
        self.insert(path, raster);
        self
    }
}

impl RasterOpener for MemoryOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn SourceRaster>> {
        self.rasters
            .get(path)
            .cloned()
            .map(|r| Box::new(r) as Box<dyn SourceRaster>)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no raster registered for {}", path.display()),
                )
            })
    }
}
