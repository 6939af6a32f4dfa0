//! The set of source files of one integration run.
//!
//! Opening a file set opens every enabled image, checks it against the
//! reference (the first enabled image), computes or retrieves the statistics
//! the run needs, and derives per-channel normalization and weighting
//! coefficients. During integration the set streams strips of rows through
//! per-file buffers.

mod statistics;

use std::fmt;
use std::path::{Path, PathBuf};

use common::float_ext::FloatExt;
use common::parallel::try_par_map_limited;
use rayon::prelude::*;

pub use statistics::{FileStatistics, STATISTICS_HIGH, STATISTICS_LOW, StatisticsNeeds};
use statistics::{channel_ikss, channel_statistics};

use crate::cache::FileDataCache;
use crate::config::{ImageItem, IntegrationConfig, Roi, WeightMode};
use crate::error::Error;
use crate::math::evaluate_noise;
use crate::progress::{CancelToken, IntegrationStage, ProgressCallback, report_progress};
use crate::source::{RasterInfo, RasterOpener, SourceRaster};

/// Drizzle rejection coordinates `(x, y)` relative to the ROI, one list per
/// channel.
pub type RejectionCoordinates = Vec<Vec<(usize, usize)>>;

/// Geometry shared by every file of a set, fixed by the reference file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    info: RasterInfo,
    roi: Roi,
    incremental: bool,
    buffer_rows: usize,
}

/// Coefficients of the reference file that the other files are scaled to.
#[derive(Debug, Clone, Copy)]
struct Reference<'a> {
    location: &'a [f64],
    dispersion: &'a [f64],
}

/// Read-only state shared by the workers opening files.
struct OpenContext<'a> {
    config: &'a IntegrationConfig,
    opener: &'a dyn RasterOpener,
    cache: Option<&'a FileDataCache<FileStatistics>>,
    needs: StatisticsNeeds,
}

// ============================================================================
// Integration file
// ============================================================================

/// One opened source file with its statistics and coefficients.
pub struct IntegrationFile {
    path: PathBuf,
    drizzle_path: Option<PathBuf>,
    raster: Box<dyn SourceRaster>,
    /// Full-width rows of the current strip, incremental sources only.
    buffer: Vec<f32>,
    /// ROI planes of non-incremental sources, read once at open.
    planes: Vec<Vec<f32>>,
    statistics: FileStatistics,
    location: Vec<f64>,
    dispersion: Vec<f64>,
    scale: Vec<f64>,
    weight: Vec<f64>,
    noise: Vec<f64>,
    pedestal: f64,
    drizzle_low: RejectionCoordinates,
    drizzle_high: RejectionCoordinates,
}

impl fmt::Debug for IntegrationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationFile")
            .field("path", &self.path)
            .field("format", &self.raster.format_name())
            .field("location", &self.location)
            .field("scale", &self.scale)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

impl IntegrationFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn drizzle_path(&self) -> Option<&Path> {
        self.drizzle_path.as_deref()
    }

    pub fn statistics(&self) -> &FileStatistics {
        &self.statistics
    }

    /// Location estimate of channel `c`: IKSS location or median.
    pub fn location(&self, c: usize) -> f64 {
        self.location[c]
    }

    pub fn dispersion(&self, c: usize) -> f64 {
        self.dispersion[c]
    }

    /// Scale factor relative to the reference file.
    pub fn scale(&self, c: usize) -> f64 {
        self.scale[c]
    }

    pub fn weight(&self, c: usize) -> f64 {
        self.weight[c]
    }

    /// Noise estimate of channel `c`, 0 if the run did not need one.
    pub fn noise(&self, c: usize) -> f64 {
        self.noise[c]
    }

    /// IKSS scale of channel `c`, 0 if the run did not need it.
    pub fn ikss(&self, c: usize) -> f64 {
        self.statistics
            .ikss
            .as_ref()
            .map_or(0.0, |v| v[c])
    }

    pub fn pedestal(&self) -> f64 {
        self.pedestal
    }

    pub fn drizzle_low_rejections(&self) -> &RejectionCoordinates {
        &self.drizzle_low
    }

    pub fn drizzle_high_rejections(&self) -> &RejectionCoordinates {
        &self.drizzle_high
    }

    pub(crate) fn push_drizzle_low(&mut self, channel: usize, x: usize, y: usize) {
        self.drizzle_low[channel].push((x, y));
    }

    pub(crate) fn push_drizzle_high(&mut self, channel: usize, x: usize, y: usize) {
        self.drizzle_high[channel].push((x, y));
    }

    fn open(
        ctx: &OpenContext<'_>,
        item: &ImageItem,
        frame: &Frame,
        reference: Option<Reference<'_>>,
    ) -> Result<Self, Error> {
        let path = item.path.clone();
        tracing::info!(path = %path.display(), "Opening file");

        let raster = ctx.opener.open(&path).map_err(|source| Error::FileOpen {
            path: path.clone(),
            source,
        })?;
        let info = raster.info();
        if !info.same_geometry(&frame.info) {
            return Err(Error::IncompatibleGeometry {
                path,
                expected: frame.info,
                actual: info,
            });
        }
        if frame.incremental && !raster.can_read_incrementally() {
            return Err(Error::IncrementalMismatch { path });
        }

        let channels = info.channels;
        let config = ctx.config;
        let cache = ctx
            .cache
            .filter(|cache| config.use_cache && cache.is_enabled());

        let mut statistics = FileStatistics::default();
        if let Some(cache) = cache {
            match cache.get(&path) {
                Ok(Some(cached)) if cached.matches_channels(channels) => {
                    tracing::debug!(path = %path.display(), "Retrieved statistics from file cache");
                    statistics = cached;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "File cache lookup skipped");
                }
            }
        }

        let mut file = Self {
            path,
            drizzle_path: None,
            raster,
            buffer: Vec::new(),
            planes: Vec::new(),
            statistics,
            location: Vec::new(),
            dispersion: Vec::new(),
            scale: Vec::new(),
            weight: Vec::new(),
            noise: Vec::new(),
            pedestal: 0.0,
            drizzle_low: vec![Vec::new(); channels],
            drizzle_high: vec![Vec::new(); channels],
        };

        let missing = ctx.needs.missing(&file.statistics);
        let full_planes = if missing.any_pixels() || !frame.incremental {
            Some(file.read_full_planes()?)
        } else {
            None
        };

        if let Some(planes) = &full_planes {
            file.compute_statistics(ctx, &missing, planes, frame)?;
        }

        if file.statistics.pedestal <= 0.0 {
            let keyword = if file.raster.can_store_keywords() {
                file.raster.keyword("PEDESTAL").unwrap_or(-1.0)
            } else {
                -1.0
            };
            file.statistics.pedestal = keyword.max(0.0);
        }
        file.pedestal = file.statistics.pedestal;

        if let Some(cache) = cache {
            if let Err(e) = cache.add(&file.path, file.statistics.clone()) {
                tracing::debug!(path = %file.path.display(), error = %e, "File cache update skipped");
            }
        }

        file.derive_coefficients(ctx, reference, channels)?;

        if !frame.incremental {
            if let Some(planes) = full_planes {
                file.planes = planes
                    .into_iter()
                    .map(|plane| crop(&plane, frame.info.width, &frame.roi))
                    .collect();
            }
        } else {
            file.buffer = vec![0.0; frame.buffer_rows * frame.info.width];
        }

        if config.generate_drizzle_data {
            let drizzle_path = item
                .drizzle_path
                .as_ref()
                .map(|p| PathBuf::from(p.to_string_lossy().trim()))
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| Error::MissingDrizzlePath {
                    path: file.path.clone(),
                })?;
            if !drizzle_path.exists() {
                return Err(Error::NoSuchFile { path: drizzle_path });
            }
            file.drizzle_path = Some(drizzle_path);
        }

        Ok(file)
    }

    fn read_full_planes(&mut self) -> Result<Vec<Vec<f32>>, Error> {
        let info = self.raster.info();
        (0..info.channels)
            .map(|c| {
                let mut plane = vec![0.0f32; info.pixels()];
                self.raster
                    .read_rows(c, 0, &mut plane)
                    .map_err(|source| Error::FileRead {
                        path: self.path.clone(),
                        source,
                    })?;
                Ok(plane)
            })
            .collect()
    }

    fn compute_statistics(
        &mut self,
        ctx: &OpenContext<'_>,
        missing: &StatisticsNeeds,
        planes: &[Vec<f32>],
        frame: &Frame,
    ) -> Result<(), Error> {
        let channels = planes.len();
        let stats = &mut self.statistics;

        if missing.any_pixels() {
            let per_channel: Vec<_> = planes
                .par_iter()
                .map(|plane| channel_statistics(plane, missing))
                .collect();
            if per_channel.iter().any(|s| s.mean.is_insignificant()) {
                return Err(Error::InsignificantSignal {
                    path: self.path.clone(),
                });
            }
            let collect = |f: fn(&statistics::ChannelStatistics) -> f64| {
                Some(per_channel.iter().map(f).collect::<Vec<_>>())
            };
            if missing.mean {
                stats.mean = collect(|s| s.mean);
            }
            if missing.median {
                stats.median = collect(|s| s.median);
            }
            if missing.avg_dev {
                stats.avg_dev = collect(|s| s.avg_dev);
            }
            if missing.mad {
                stats.mad = collect(|s| s.mad);
            }
            if missing.bwmv {
                stats.bwmv = collect(|s| s.bwmv);
            }
            if missing.pbmv {
                stats.pbmv = collect(|s| s.pbmv);
            }
            if missing.sn {
                stats.sn = collect(|s| s.sn);
            }
            if missing.qn {
                stats.qn = collect(|s| s.qn);
            }
        }

        if missing.ikss {
            let (ikss, iksl): (Vec<f64>, Vec<f64>) =
                planes.par_iter().map(|plane| channel_ikss(plane)).unzip();
            stats.ikss = Some(ikss);
            stats.iksl = Some(iksl);
        }

        if missing.noise {
            let from_keywords = if !ctx.config.ignore_noise_keywords
                && self.raster.can_store_keywords()
            {
                (0..channels)
                    .map(|c| {
                        self.raster
                            .keyword(&format!("NOISE{c:02}"))
                            .filter(|&v| v > 0.0)
                            .or_else(|| self.raster.keyword("NOISE").filter(|&v| v > 0.0))
                    })
                    .collect::<Option<Vec<f64>>>()
            } else {
                None
            };

            stats.noise = Some(match from_keywords {
                Some(noise) => noise,
                None => {
                    let (width, height) = (frame.info.width, frame.info.height);
                    let fraction = f64::from(ctx.config.mrs_min_data_fraction);
                    planes
                        .par_iter()
                        .map(|plane| evaluate_noise(plane, width, height, fraction).sigma)
                        .collect()
                }
            });
        }

        Ok(())
    }

    fn derive_coefficients(
        &mut self,
        ctx: &OpenContext<'_>,
        reference: Option<Reference<'_>>,
        channels: usize,
    ) -> Result<(), Error> {
        let config = ctx.config;
        let estimator = config.scale_estimator;
        let zeros = || vec![0.0; channels];

        self.dispersion = self
            .statistics
            .dispersion(estimator)
            .map_or_else(zeros, <[f64]>::to_vec);
        self.location = self
            .statistics
            .location(estimator)
            .map_or_else(zeros, <[f64]>::to_vec);
        self.noise = self.statistics.noise.clone().unwrap_or_else(zeros);

        self.scale = vec![1.0; channels];
        if ctx.needs.scale {
            for c in 0..channels {
                if self.dispersion[c].is_insignificant() {
                    return Err(Error::InsignificantSignal {
                        path: self.path.clone(),
                    });
                }
                if let Some(reference) = reference {
                    self.scale[c] = reference.dispersion[c] / self.dispersion[c];
                }
            }
            tracing::debug!(
                path = %self.path.display(),
                scale = ?self.scale,
                zero_offset = ?reference.map(|r| {
                    r.location.iter().zip(&self.location).map(|(a, b)| a - b).collect::<Vec<_>>()
                }),
                noise = ?self.noise,
                "Normalization coefficients"
            );
        }

        self.weight = vec![1.0; channels];
        if config.generates_output() && config.uses_weights() {
            self.weight = self.weights(config, channels)?;
            if self
                .weight
                .iter()
                .any(|w| !w.is_finite() || w.is_insignificant())
            {
                return Err(Error::InsignificantSignal {
                    path: self.path.clone(),
                });
            }
            tracing::debug!(
                path = %self.path.display(),
                weight = ?self.weight,
                "Combination weights"
            );
        }
        Ok(())
    }

    fn weights(&self, config: &IntegrationConfig, channels: usize) -> Result<Vec<f64>, Error> {
        let raster = &self.raster;
        let stat = |v: &Option<Vec<f64>>| v.clone().unwrap_or_else(|| vec![0.0; channels]);
        Ok(match config.weight_mode {
            WeightMode::DontCare => vec![1.0; channels],
            WeightMode::ExposureTime => {
                let keyword = |name: &str| {
                    raster
                        .can_store_keywords()
                        .then(|| raster.keyword(name))
                        .flatten()
                        .filter(|&t| t > 0.0)
                };
                let exposure = raster
                    .exposure()
                    .filter(|&t| t > 0.0)
                    .or_else(|| keyword("EXPTIME"))
                    .or_else(|| keyword("EXPOSURE"))
                    .ok_or_else(|| Error::MissingExposure {
                        path: self.path.clone(),
                    })?;
                vec![exposure; channels]
            }
            WeightMode::NoiseEvaluation => (0..channels)
                .map(|c| {
                    let e = self.scale[c] * self.noise[c];
                    let e2 = e * e;
                    if !e2.is_finite() || e2.is_insignificant() {
                        Err(Error::NoiseEstimate {
                            path: self.path.clone(),
                            channel: c,
                        })
                    } else {
                        Ok(1.0 / e2)
                    }
                })
                .collect::<Result<_, _>>()?,
            WeightMode::Keyword => {
                if !raster.can_store_keywords() {
                    return Err(Error::KeywordsUnsupported {
                        path: self.path.clone(),
                    });
                }
                let keyword = config.weight_keyword.trim();
                let w = raster
                    .keyword(keyword)
                    .filter(|&w| w > 0.0)
                    .ok_or_else(|| Error::InvalidWeightKeyword {
                        path: self.path.clone(),
                        keyword: keyword.to_string(),
                    })?;
                vec![w; channels]
            }
            WeightMode::SignalWeight => stat(&self.statistics.avg_dev),
            WeightMode::MedianWeight => stat(&self.statistics.median),
            WeightMode::AverageWeight => stat(&self.statistics.mean),
        })
    }

    fn read_strip(&mut self, frame: &Frame, start_row: usize, channel: usize) -> Result<(), Error> {
        if !frame.incremental {
            return Ok(());
        }
        let rows = frame.buffer_rows.min(frame.roi.height - start_row);
        let len = rows * frame.info.width;
        self.raster
            .read_rows(channel, frame.roi.top + start_row, &mut self.buffer[..len])
            .map_err(|source| Error::FileRead {
                path: self.path.clone(),
                source,
            })
    }
}

/// Copies the `roi` window out of a `width`-wide plane.
fn crop(plane: &[f32], width: usize, roi: &Roi) -> Vec<f32> {
    plane
        .chunks_exact(width)
        .skip(roi.top)
        .take(roi.height)
        .flat_map(|row| &row[roi.left..roi.right()])
        .copied()
        .collect()
}

// ============================================================================
// File set
// ============================================================================

/// All opened files of a run. File 0 is the reference.
#[derive(Debug)]
pub struct FileSet {
    files: Vec<IntegrationFile>,
    frame: Frame,
    start_row: usize,
    channel: usize,
}

impl FileSet {
    /// Opens every enabled image of `config`.
    ///
    /// Files after the reference are opened in parallel batches when
    /// `use_file_threads` is set. Any failure drops every file opened so far
    /// and is returned.
    pub fn open(
        config: &IntegrationConfig,
        opener: &dyn RasterOpener,
        cache: Option<&FileDataCache<FileStatistics>>,
        cancel: &CancelToken,
        progress: &ProgressCallback,
    ) -> Result<Self, Error> {
        config.validate()?;

        let items: Vec<&ImageItem> = config.enabled_images().collect();
        let total = items.len();
        let ctx = OpenContext {
            config,
            opener,
            cache,
            needs: StatisticsNeeds::from_config(config),
        };
        tracing::info!(files = total, needs = ?ctx.needs, "Opening files");
        report_progress(progress, 0, total, IntegrationStage::OpeningFiles);
        cancel.check()?;

        let frame = Self::reference_frame(config, opener, &items[0].path)?;
        let reference = IntegrationFile::open(&ctx, items[0], &frame, None)?;
        let coefficients = Reference {
            location: &reference.location,
            dispersion: &reference.dispersion,
        };
        report_progress(progress, 1, total, IntegrationStage::OpeningFiles);

        let rest = &items[1..];
        let others = if config.use_file_threads && rest.len() > 1 {
            let threads = (rayon::current_num_threads() as f32 * config.file_thread_overload)
                .round()
                .max(1.0) as usize;
            let threads = threads.min(rest.len());
            tracing::debug!(threads, "Opening files in parallel");
            try_par_map_limited(
                rest,
                threads,
                |done| {
                    report_progress(progress, 1 + done, total, IntegrationStage::OpeningFiles);
                    cancel.check()
                },
                |item| IntegrationFile::open(&ctx, item, &frame, Some(coefficients)),
            )?
        } else {
            let mut opened = Vec::with_capacity(rest.len());
            for (i, item) in rest.iter().enumerate() {
                report_progress(progress, 1 + i, total, IntegrationStage::OpeningFiles);
                cancel.check()?;
                opened.push(IntegrationFile::open(&ctx, item, &frame, Some(coefficients))?);
            }
            opened
        };
        cancel.check()?;
        report_progress(progress, total, total, IntegrationStage::OpeningFiles);

        let mut files = Vec::with_capacity(total);
        files.push(reference);
        files.extend(others);

        tracing::info!(
            files = files.len(),
            width = frame.roi.width,
            height = frame.roi.height,
            channels = frame.info.channels,
            buffer_rows = frame.buffer_rows,
            incremental = frame.incremental,
            "Opened file set"
        );

        Ok(Self {
            files,
            frame,
            start_row: 0,
            channel: 0,
        })
    }

    /// Probes the reference image for the geometry shared by the set.
    fn reference_frame(
        config: &IntegrationConfig,
        opener: &dyn RasterOpener,
        path: &Path,
    ) -> Result<Frame, Error> {
        let raster = opener.open(path).map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let info = raster.info();
        let incremental = raster.can_read_incrementally();

        let full = Roi::new(0, 0, info.width, info.height);
        let roi = config
            .roi
            .unwrap_or(full)
            .intersect(info.width, info.height)
            .ok_or(Error::InvalidRoi)?;

        let buffer_rows = if incremental {
            let rows = config.buffer_size_mb * 1024 * 1024 / (info.width * size_of::<f32>()).max(1);
            rows.clamp(1, roi.height)
        } else {
            tracing::warn!(
                path = %path.display(),
                format = raster.format_name(),
                "Incremental file reading is not available; full images will be loaded"
            );
            roi.height
        };

        Ok(Frame {
            info,
            roi,
            incremental,
            buffer_rows,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[IntegrationFile] {
        &self.files
    }

    pub fn file(&self, index: usize) -> &IntegrationFile {
        &self.files[index]
    }

    pub(crate) fn file_mut(&mut self, index: usize) -> &mut IntegrationFile {
        &mut self.files[index]
    }

    pub fn reference(&self) -> &IntegrationFile {
        &self.files[0]
    }

    /// Integration width: the ROI width.
    pub fn width(&self) -> usize {
        self.frame.roi.width
    }

    /// Integration height: the ROI height.
    pub fn height(&self) -> usize {
        self.frame.roi.height
    }

    pub fn channels(&self) -> usize {
        self.frame.info.channels
    }

    pub fn is_color(&self) -> bool {
        self.frame.info.is_color
    }

    pub fn is_incremental(&self) -> bool {
        self.frame.incremental
    }

    /// Rows per buffered strip.
    pub fn buffer_rows(&self) -> usize {
        self.frame.buffer_rows
    }

    pub fn roi(&self) -> Roi {
        self.frame.roi
    }

    /// Geometry of the full source frames.
    pub fn frame_info(&self) -> RasterInfo {
        self.frame.info
    }

    /// Pixels per channel of the integrated image.
    pub fn pixels(&self) -> usize {
        self.width() * self.height()
    }

    /// Loads the strip of rows starting at ROI row `start_row` of `channel`
    /// into every file buffer.
    pub fn update_buffers(&mut self, start_row: usize, channel: usize) -> Result<(), Error> {
        let frame = self.frame;
        self.files
            .par_iter_mut()
            .try_for_each(|file| file.read_strip(&frame, start_row, channel))?;
        self.start_row = start_row;
        self.channel = channel;
        Ok(())
    }

    /// Row `row` of the current strip of file `file`, cropped to the ROI.
    pub fn row(&self, file: usize, row: usize) -> &[f32] {
        let f = &self.files[file];
        let roi = &self.frame.roi;
        if self.frame.incremental {
            let start = row * self.frame.info.width + roi.left;
            &f.buffer[start..start + roi.width]
        } else {
            let start = (self.start_row + row) * roi.width;
            &f.planes[self.channel][start..start + roi.width]
        }
    }
}
