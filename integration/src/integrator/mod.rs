//! Integration orchestration.
//!
//! An [`Integrator`] runs the whole pipeline for one configuration: it opens
//! the file set, streams every channel through strips of buffered rows and
//! batches of pixel stacks (load, reject, tally, combine), then post-processes
//! the integrated image and assembles the report.


use std::time::Instant;

use crate::cache::FileDataCache;
use crate::combination::CombinationEngine;
use crate::config::IntegrationConfig;
use crate::drizzle::{DrizzleSink, FileDrizzleSink, export_drizzle_data};
use crate::error::Error;
use crate::file_set::{FileSet, FileStatistics};
use crate::math::statistics::median;
use crate::math::{evaluate_noise, ikss, snr};
use crate::output::{
    HIGH_REJECTION_MAP_ID, INTEGRATION_ID, LOW_REJECTION_MAP_ID, MapRaster, OutputIds,
    OutputRaster, Planes, SLOPE_MAP_ID,
};
use crate::progress::{CancelToken, IntegrationStage, ProgressCallback, report_progress};
use crate::rejection::{NormalizationCoefficients, RejectionEngine};
use crate::report::{
    ChannelNoise, DescriptionItems, FileReport, IntegrationReport, OutputIdentifiers, Pedestal,
    RejectionCounts,
};
use crate::source::RasterOpener;
use crate::stack::{StackStrip, stack_rows};

/// Upper limit of the samples SNR is evaluated over.
const SNR_HIGH: f32 = 0.85;

/// Result of [`Integrator::integrate`].
#[derive(Debug)]
pub enum Outcome {
    Completed(Box<IntegrationResult>),
    Cancelled,
}

impl Outcome {
    pub fn completed(self) -> Option<IntegrationResult> {
        match self {
            Self::Completed(result) => Some(*result),
            Self::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Rasters and report of a completed run.
#[derive(Debug)]
pub struct IntegrationResult {
    pub image: Option<OutputRaster>,
    pub low_rejection_map: Option<MapRaster>,
    pub high_rejection_map: Option<MapRaster>,
    pub slope_map: Option<MapRaster>,
    pub report: IntegrationReport,
}

/// Diagnostic planes filled while integrating, one per channel.
#[derive(Debug, Default)]
struct Maps {
    low: Option<Vec<Vec<f32>>>,
    high: Option<Vec<Vec<f32>>>,
    slope: Option<Vec<Vec<f32>>>,
}

/// Per-run state of the tally of rejected samples.
struct Tally<'a> {
    channel: usize,
    width: usize,
    files: usize,
    map_range_rejection: bool,
    drizzle: bool,
    counts: &'a mut [Vec<RejectionCounts>],
    maps: &'a mut Maps,
}

impl Tally<'_> {
    /// Counts the rejected entries of every loaded stack of `strip`, whose
    /// first row is integration row `y0`.
    fn add(&mut self, strip: &StackStrip, y0: usize, file_set: &mut FileSet) {
        let c = self.channel;
        for r in 0..strip.rows() {
            let y = y0 + r;
            for x in 0..self.width {
                let (mut nl, mut nh, mut nrl, mut nrh) = (0usize, 0usize, 0usize, 0usize);
                for e in strip.stack(r, x) {
                    let i = e.file();
                    let counts = &mut self.counts[i][c];
                    if e.reject_low {
                        counts.low += 1;
                        nl += 1;
                    }
                    if e.range_low {
                        counts.range_low += 1;
                        nrl += 1;
                    }
                    if e.reject_high {
                        counts.high += 1;
                        nh += 1;
                    }
                    if e.range_high {
                        counts.range_high += 1;
                        nrh += 1;
                    }
                    if self.drizzle {
                        if e.is_low_rejected() {
                            file_set.file_mut(i).push_drizzle_low(c, x, y);
                        }
                        if e.is_high_rejected() {
                            file_set.file_mut(i).push_drizzle_high(c, x, y);
                        }
                    }
                }

                let index = y * self.width + x;
                let fraction = |n: usize, nr: usize| {
                    let n = if self.map_range_rejection { n + nr } else { n };
                    n as f32 / self.files as f32
                };
                if let Some(low) = &mut self.maps.low {
                    low[c][index] = fraction(nl, nrl);
                }
                if let Some(high) = &mut self.maps.high {
                    high[c][index] = fraction(nh, nrh);
                }
                if let Some(slope) = &mut self.maps.slope {
                    slope[c][index] = strip.slope(r, x);
                }
            }
        }
    }
}

/// Runs integrations of one configuration.
///
/// Output identifiers are allocated per integrator: repeated runs get
/// suffixed identifiers unless `close_previous_images` is set.
pub struct Integrator {
    config: IntegrationConfig,
    ids: OutputIds,
    drizzle_sink: Box<dyn DrizzleSink>,
}

impl std::fmt::Debug for Integrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrator")
            .field("config", &self.config)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl Integrator {
    pub fn new(config: IntegrationConfig) -> Self {
        Self {
            config,
            ids: OutputIds::new(),
            drizzle_sink: Box::new(FileDrizzleSink),
        }
    }

    /// Replaces the destination of drizzle data, the drizzle files by default.
    pub fn with_drizzle_sink(mut self, sink: impl DrizzleSink + 'static) -> Self {
        self.drizzle_sink = Box::new(sink);
        self
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Integrates the enabled images of the configuration.
    ///
    /// `cache` supplies and receives file statistics when `use_cache` is set.
    /// Cancellation through `cancel` yields [`Outcome::Cancelled`].
    pub fn integrate(
        &mut self,
        opener: &dyn RasterOpener,
        cache: Option<&FileDataCache<FileStatistics>>,
        cancel: &CancelToken,
        progress: &ProgressCallback,
    ) -> Result<Outcome, Error> {
        let start = Instant::now();
        match self.run(opener, cache, cancel, progress) {
            Ok(result) => {
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Integration completed"
                );
                Ok(Outcome::Completed(Box::new(result)))
            }
            Err(Error::Cancelled) => {
                tracing::info!("Integration cancelled");
                Ok(Outcome::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    fn run(
        &mut self,
        opener: &dyn RasterOpener,
        cache: Option<&FileDataCache<FileStatistics>>,
        cancel: &CancelToken,
        progress: &ProgressCallback,
    ) -> Result<IntegrationResult, Error> {
        let config = &self.config;
        config.validate()?;
        let description = DescriptionItems::from_config(config);
        tracing::info!(
            "Integration of {} images\n{}",
            config.enabled_count(),
            description.to_text()
        );

        let cache = cache.filter(|_| config.use_cache);
        let mut file_set = FileSet::open(config, opener, cache, cancel, progress)?;

        let (width, height) = (file_set.width(), file_set.height());
        let (channels, files) = (file_set.channels(), file_set.len());
        let pixels = width * height;

        let do_reject = config.rejection_active();
        let linear_fit = config.rejection.is_linear_fit();
        let maps_enabled = config.generate_rejection_maps;
        let plane = || vec![vec![0.0f32; pixels]; channels];
        let mut maps = Maps {
            low: (maps_enabled && do_reject && (config.clip_low || config.range_clip_low))
                .then(plane),
            high: (maps_enabled && do_reject && (config.clip_high || config.range_clip_high))
                .then(plane),
            slope: (maps_enabled && linear_fit).then(plane),
        };
        let mut image = config
            .generate_integrated_image
            .then(|| Planes::new(channels, pixels, config.generate_64bit_result));
        let mut counts = vec![vec![RejectionCounts::default(); channels]; files];

        let batch_rows = stack_rows(
            config.stack_size_mb,
            width,
            files,
            linear_fit,
            file_set.buffer_rows(),
        );
        let mut strip = StackStrip::new(width, files, batch_rows, maps.slope.is_some());
        tracing::info!(
            files,
            width,
            height,
            channels,
            buffer_rows = file_set.buffer_rows(),
            stack_rows = batch_rows,
            "Integrating pixel rows"
        );

        for c in 0..channels {
            let rejection =
                RejectionEngine::new(config, NormalizationCoefficients::new(config, &file_set, c));
            let combination = CombinationEngine::new(config, &file_set, c);
            let stage = IntegrationStage::Integrating { channel: c };
            report_progress(progress, 0, height, stage);

            let mut y0 = 0;
            while y0 < height {
                let strip_rows = file_set.buffer_rows().min(height - y0);
                cancel.check()?;
                file_set.update_buffers(y0, c)?;

                let mut r0 = 0;
                while r0 < strip_rows {
                    cancel.check()?;
                    let rows = batch_rows.min(strip_rows - r0);
                    let y = y0 + r0;
                    strip.load(&file_set, r0, rows);

                    if do_reject {
                        rejection.run(&mut strip);
                        Tally {
                            channel: c,
                            width,
                            files,
                            map_range_rejection: config.map_range_rejection,
                            drizzle: config.generate_drizzle_data,
                            counts: &mut counts,
                            maps: &mut maps,
                        }
                        .add(&strip, y, &mut file_set);
                    }

                    if let Some(image) = &mut image {
                        let range = y * width..(y + rows) * width;
                        match image {
                            Planes::F32(p) => combination.run(&mut strip, &mut p[c][range]),
                            Planes::F64(p) => combination.run(&mut strip, &mut p[c][range]),
                        }
                    }

                    r0 += rows;
                    report_progress(progress, y + rows, height, stage);
                }
                y0 += strip_rows;
            }
        }
        cancel.check()?;

        let noise = match &mut image {
            Some(planes) => {
                if planes.normalize() {
                    tracing::info!("Integrated image rescaled to [0, 1]");
                }
                config
                    .evaluate_noise
                    .then(|| evaluate_final_noise(config, &file_set, planes, progress))
            }
            None => None,
        };

        let pedestal = Pedestal::aggregate(file_set.files().iter().map(|f| f.pedestal()));
        if pedestal == Pedestal::Inconsistent {
            tracing::warn!("Inconsistent pedestal values in the integrated images");
        }

        let drizzle = config
            .generate_drizzle_data
            .then(|| export_drizzle_data(&file_set, self.drizzle_sink.as_ref()));

        let replace = config.close_previous_images;
        let output_ids = OutputIdentifiers {
            integration: image
                .as_ref()
                .map(|_| self.ids.allocate(INTEGRATION_ID, replace)),
            low_rejection_map: maps
                .low
                .as_ref()
                .map(|_| self.ids.allocate(LOW_REJECTION_MAP_ID, replace)),
            high_rejection_map: maps
                .high
                .as_ref()
                .map(|_| self.ids.allocate(HIGH_REJECTION_MAP_ID, replace)),
            slope_map: maps
                .slope
                .as_ref()
                .map(|_| self.ids.allocate(SLOPE_MAP_ID, replace)),
        };

        let reference = file_set.reference();
        let file_reports = file_set
            .files()
            .iter()
            .zip(counts)
            .map(|(file, rejected)| FileReport {
                path: file.path().to_path_buf(),
                weight: (0..channels).map(|c| file.weight(c)).collect(),
                scale: (0..channels).map(|c| file.scale(c)).collect(),
                zero_offset: (0..channels)
                    .map(|c| reference.location(c) - file.location(c))
                    .collect(),
                rejected,
            })
            .collect::<Vec<_>>();
        let mut total_rejected = vec![RejectionCounts::default(); channels];
        for file in &file_reports {
            for (total, counts) in total_rejected.iter_mut().zip(&file.rejected) {
                total.add(counts);
            }
        }

        let mut report = IntegrationReport {
            channels,
            pixels: pixels as u64,
            total_pixels: (pixels * files) as u64,
            total_rejected,
            files: file_reports,
            report_range_rejection: config.report_range_rejection,
            noise,
            pedestal,
            description,
            keywords: vec![],
            output_ids,
            drizzle,
        };
        report.keywords = report.provenance_keywords(do_reject);
        tracing::info!("{}", report.summary_text());

        let is_color = file_set.is_color();
        drop(file_set);

        let map_raster = |id: &Option<String>, planes: Option<Vec<Vec<f32>>>| {
            id.clone().zip(planes).map(|(id, planes)| MapRaster {
                id,
                width,
                height,
                planes,
            })
        };
        let ids = &report.output_ids;
        Ok(IntegrationResult {
            image: ids
                .integration
                .clone()
                .zip(image)
                .map(|(id, planes)| OutputRaster {
                    id,
                    width,
                    height,
                    is_color,
                    planes,
                }),
            low_rejection_map: map_raster(&ids.low_rejection_map, maps.low),
            high_rejection_map: map_raster(&ids.high_rejection_map, maps.high),
            slope_map: map_raster(&ids.slope_map, maps.slope),
            report,
        })
    }
}

/// Noise, scale, location and SNR of every channel of the integrated image,
/// with the noise reductions relative to the source files.
fn evaluate_final_noise(
    config: &IntegrationConfig,
    file_set: &FileSet,
    planes: &Planes,
    progress: &ProgressCallback,
) -> Vec<ChannelNoise> {
    let (width, height) = (file_set.width(), file_set.height());
    let channels = planes.channels();
    let reduction = |file_noise: f64, file_scale: f64, noise: f64, scale: f64| {
        let d = noise * file_scale / scale;
        if d > 0.0 && d.is_finite() {
            file_noise / d
        } else {
            0.0
        }
    };

    (0..channels)
        .map(|c| {
            report_progress(progress, c, channels, IntegrationStage::EvaluatingNoise);
            let plane = planes.plane_f32(c);
            let estimate =
                evaluate_noise(&plane, width, height, f64::from(config.mrs_min_data_fraction));
            let est = ikss(&plane, 0.0, 1.0);
            let noise = estimate.sigma;

            let reference = file_set.reference();
            let reference_reduction =
                reduction(reference.noise(c), reference.ikss(c), noise, est.scale);
            let reductions: Vec<f64> = file_set
                .files()
                .iter()
                .map(|f| reduction(f.noise(c), f.ikss(c), noise, est.scale))
                .collect();

            tracing::debug!(
                channel = c,
                noise,
                layers = estimate.layers,
                scale = est.scale,
                location = est.location,
                "Evaluated noise of the integrated image"
            );
            ChannelNoise {
                noise,
                scale: est.scale,
                location: est.location,
                snr: if noise > 0.0 {
                    snr(&plane, noise, 0.0, SNR_HIGH)
                } else {
                    0.0
                },
                reference_reduction,
                median_reduction: median(&reductions),
            }
        })
        .collect()
}
