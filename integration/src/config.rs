//! Integration configuration.
//!
//! A single [`IntegrationConfig`] carries every option of a run: the image
//! list, pixel combination, output normalization, weighting, rejection and
//! resource budgets. Defaults reproduce the classic ImageIntegration process
//! defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::error::Error;

/// Pixel combination operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize, Deserialize,
)]
pub enum Combination {
    #[default]
    #[strum(to_string = "average")]
    Average,
    #[strum(to_string = "median")]
    Median,
    #[strum(to_string = "minimum")]
    Minimum,
    #[strum(to_string = "maximum")]
    Maximum,
}

/// Normalization applied to raw samples before combination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize, Deserialize,
)]
pub enum OutputNormalization {
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "additive")]
    Additive,
    #[strum(to_string = "multiplicative")]
    Multiplicative,
    #[default]
    #[strum(to_string = "additive + scaling")]
    AdditiveWithScaling,
    #[strum(to_string = "multiplicative + scaling")]
    MultiplicativeWithScaling,
}

impl OutputNormalization {
    pub fn is_scaling(self) -> bool {
        matches!(
            self,
            Self::AdditiveWithScaling | Self::MultiplicativeWithScaling
        )
    }

    pub fn is_additive(self) -> bool {
        matches!(self, Self::Additive | Self::AdditiveWithScaling)
    }
}

/// How per-file combination weights are derived.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize, Deserialize,
)]
pub enum WeightMode {
    /// Uniform weights.
    #[strum(to_string = "don't care")]
    DontCare,
    #[strum(to_string = "exposure time")]
    ExposureTime,
    /// Inverse squared scaled noise estimate.
    #[default]
    #[strum(to_string = "noise evaluation")]
    NoiseEvaluation,
    /// Average absolute deviation from the median.
    #[strum(to_string = "average absolute deviation")]
    SignalWeight,
    #[strum(to_string = "median value")]
    MedianWeight,
    #[strum(to_string = "average value")]
    AverageWeight,
    /// Numeric metadata field named by [`IntegrationConfig::weight_keyword`].
    #[strum(to_string = "custom keyword")]
    Keyword,
}

/// Estimator of statistical dispersion used for scaling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize, Deserialize,
)]
pub enum ScaleEstimator {
    #[strum(to_string = "average absolute deviation")]
    AvgDev,
    #[strum(to_string = "MAD")]
    Mad,
    #[strum(to_string = "biweight midvariance")]
    BiweightMidvariance,
    #[strum(to_string = "percentage bend midvariance")]
    PercentageBendMidvariance,
    #[strum(to_string = "Sn")]
    Sn,
    #[strum(to_string = "Qn")]
    Qn,
    /// Iterative k-sigma clipping with biweight midvariance.
    #[default]
    #[strum(to_string = "iterative k-sigma / BWMV")]
    Ikss,
}

/// Statistical pixel rejection algorithm.
///
/// Thresholds follow the classic conventions: sigma multiples for the sigma
/// family and the CCD model, tolerance multiples for linear fit, fractional
/// distances from the median for percentile clipping, sample counts for
/// min/max clipping.
#[derive(Debug, Clone, Copy, PartialEq, Default, Display, Serialize, Deserialize)]
pub enum Rejection {
    #[default]
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "min/max clipping")]
    MinMax { low: usize, high: usize },
    #[strum(to_string = "percentile clipping")]
    Percentile { low: f32, high: f32 },
    #[strum(to_string = "sigma clipping")]
    Sigma { low: f32, high: f32 },
    #[strum(to_string = "Winsorized sigma clipping")]
    WinsorizedSigma { low: f32, high: f32 },
    #[strum(to_string = "averaged sigma clipping")]
    AveragedSigma { low: f32, high: f32 },
    #[strum(to_string = "linear fit clipping")]
    LinearFit { low: f32, high: f32 },
    #[strum(to_string = "CCD noise model")]
    CcdNoise {
        /// Sensor gain in e-/ADU.
        gain: f32,
        /// Read noise in e-.
        read_noise: f32,
        /// Scale (sensitivity) noise as a fraction.
        scale_noise: f32,
        low: f32,
        high: f32,
    },
}

impl Rejection {
    pub fn min_max() -> Self {
        Self::MinMax { low: 1, high: 1 }
    }

    pub fn percentile() -> Self {
        Self::Percentile {
            low: 0.2,
            high: 0.1,
        }
    }

    pub fn sigma() -> Self {
        Self::Sigma {
            low: 4.0,
            high: 2.0,
        }
    }

    pub fn winsorized_sigma() -> Self {
        Self::WinsorizedSigma {
            low: 4.0,
            high: 2.0,
        }
    }

    pub fn averaged_sigma() -> Self {
        Self::AveragedSigma {
            low: 4.0,
            high: 2.0,
        }
    }

    pub fn linear_fit() -> Self {
        Self::LinearFit {
            low: 5.0,
            high: 2.5,
        }
    }

    pub fn ccd_noise() -> Self {
        Self::CcdNoise {
            gain: 1.0,
            read_noise: 10.0,
            scale_noise: 0.0,
            low: 4.0,
            high: 2.0,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_linear_fit(&self) -> bool {
        matches!(self, Self::LinearFit { .. })
    }
}

/// Normalization applied to stacks before statistical rejection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter, Serialize, Deserialize,
)]
pub enum RejectionNormalization {
    #[strum(to_string = "none")]
    None,
    #[default]
    #[strum(to_string = "scale + zero offset")]
    Scale,
    #[strum(to_string = "equalize fluxes")]
    EqualizeFluxes,
}

/// Region of interest in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

impl Roi {
    pub fn new(left: usize, top: usize, width: usize, height: usize) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> usize {
        self.left + self.width
    }

    pub fn bottom(&self) -> usize {
        self.top + self.height
    }

    /// Intersection with a `width` x `height` frame, `None` if empty.
    pub fn intersect(&self, width: usize, height: usize) -> Option<Roi> {
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        if self.left >= right || self.top >= bottom {
            return None;
        }
        Some(Roi::new(
            self.left,
            self.top,
            right - self.left,
            bottom - self.top,
        ))
    }
}

/// One entry of the input image list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    pub path: PathBuf,
    pub enabled: bool,
    /// Drizzle data file receiving this run's statistics and rejection data.
    pub drizzle_path: Option<PathBuf>,
}

impl ImageItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
            drizzle_path: None,
        }
    }

    pub fn with_drizzle(mut self, path: impl Into<PathBuf>) -> Self {
        self.drizzle_path = Some(path.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Complete configuration of an integration run.
///
/// ```ignore
/// use integration::{IntegrationConfig, Rejection, Combination};
///
/// let config = IntegrationConfig {
///     combination: Combination::Median,
///     rejection: Rejection::winsorized_sigma(),
///     ..IntegrationConfig::default()
/// }
/// .with_images(["a.fits", "b.fits", "c.fits"]);
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub images: Vec<ImageItem>,

    pub combination: Combination,
    pub normalization: OutputNormalization,
    pub weight_mode: WeightMode,
    pub weight_keyword: String,
    pub scale_estimator: ScaleEstimator,
    /// Always evaluate noise, even if the images carry `NOISExx` keywords.
    pub ignore_noise_keywords: bool,

    pub rejection: Rejection,
    pub rejection_normalization: RejectionNormalization,
    pub clip_low: bool,
    pub clip_high: bool,
    pub range_clip_low: bool,
    pub range_low: f32,
    pub range_clip_high: bool,
    pub range_high: f32,
    /// Count range rejected samples in the rejection maps.
    pub map_range_rejection: bool,
    /// Count range rejected samples in the rejection report.
    pub report_range_rejection: bool,

    pub generate_64bit_result: bool,
    pub generate_rejection_maps: bool,
    pub generate_integrated_image: bool,
    pub generate_drizzle_data: bool,
    pub close_previous_images: bool,

    /// Row buffer budget per file, in MiB.
    pub buffer_size_mb: usize,
    /// Pixel stack budget, in MiB.
    pub stack_size_mb: usize,
    pub roi: Option<Roi>,

    pub use_cache: bool,
    pub evaluate_noise: bool,
    /// Minimum fraction of pixels the MRS noise estimate must be based on.
    pub mrs_min_data_fraction: f32,

    pub use_file_threads: bool,
    pub file_thread_overload: f32,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            images: vec![],
            combination: Combination::Average,
            normalization: OutputNormalization::AdditiveWithScaling,
            weight_mode: WeightMode::NoiseEvaluation,
            weight_keyword: String::new(),
            scale_estimator: ScaleEstimator::Ikss,
            ignore_noise_keywords: false,
            rejection: Rejection::None,
            rejection_normalization: RejectionNormalization::Scale,
            clip_low: true,
            clip_high: true,
            range_clip_low: true,
            range_low: 0.0,
            range_clip_high: false,
            range_high: 0.98,
            map_range_rejection: true,
            report_range_rejection: false,
            generate_64bit_result: false,
            generate_rejection_maps: true,
            generate_integrated_image: true,
            generate_drizzle_data: false,
            close_previous_images: false,
            buffer_size_mb: 16,
            stack_size_mb: 1024,
            roi: None,
            use_cache: true,
            evaluate_noise: true,
            mrs_min_data_fraction: 0.01,
            use_file_threads: true,
            file_thread_overload: 1.0,
        }
    }
}

impl IntegrationConfig {
    // ========== Presets ==========

    /// Preset: plain average with no normalization, weighting or rejection.
    pub fn plain_average() -> Self {
        Self {
            normalization: OutputNormalization::None,
            weight_mode: WeightMode::DontCare,
            rejection_normalization: RejectionNormalization::None,
            range_clip_low: false,
            ..Default::default()
        }
    }

    /// Preset: sigma-clipped average.
    pub fn sigma_clipped(low: f32, high: f32) -> Self {
        Self {
            rejection: Rejection::Sigma { low, high },
            ..Default::default()
        }
    }

    /// Preset: Winsorized sigma-clipped average.
    pub fn winsorized(low: f32, high: f32) -> Self {
        Self {
            rejection: Rejection::WinsorizedSigma { low, high },
            ..Default::default()
        }
    }

    /// Preset: linear fit clipping, suited to large stacks with sky gradients.
    pub fn linear_fit(low: f32, high: f32) -> Self {
        Self {
            rejection: Rejection::LinearFit { low, high },
            ..Default::default()
        }
    }

    /// Preset: median combination without rejection.
    pub fn median() -> Self {
        Self {
            combination: Combination::Median,
            ..Default::default()
        }
    }

    pub fn with_images<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.images = paths.into_iter().map(ImageItem::new).collect();
        self
    }

    // ========== Derived flags ==========

    pub fn enabled_images(&self) -> impl Iterator<Item = &ImageItem> {
        self.images.iter().filter(|item| item.enabled)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled_images().count()
    }

    /// Any rejection stage, statistical or range, is active.
    pub fn rejection_active(&self) -> bool {
        !self.rejection.is_none() || self.range_clip_low || self.range_clip_high
    }

    pub fn range_clipping(&self) -> bool {
        self.range_clip_low || self.range_clip_high
    }

    /// Per-pixel output is produced, either as an image or as drizzle data.
    pub fn generates_output(&self) -> bool {
        self.generate_integrated_image || self.generate_drizzle_data
    }

    /// Per-file weights are used, for average combination or drizzle data.
    pub fn uses_weights(&self) -> bool {
        self.generate_drizzle_data || self.combination == Combination::Average
    }

    // ========== Validation ==========

    /// Checks everything that can be checked before opening any file.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(roi) = &self.roi {
            if roi.is_empty() {
                return Err(Error::EmptyRoi);
            }
        }

        let count = self.enabled_count();
        if count < 3 {
            return Err(Error::TooFewImages { count });
        }
        if self.rejection.is_linear_fit() && count < 5 {
            return Err(Error::TooFewImagesForLinearFit { count });
        }

        if self.weight_mode == WeightMode::Keyword
            && self.uses_weights()
            && self.weight_keyword.trim().is_empty()
        {
            return Err(Error::EmptyWeightKeyword);
        }

        match self.rejection {
            Rejection::None | Rejection::MinMax { .. } => {}
            Rejection::Percentile { low, high } => {
                check_range("percentile low", low, 0.0, 1.0)?;
                check_range("percentile high", high, 0.0, 1.0)?;
            }
            Rejection::Sigma { low, high }
            | Rejection::WinsorizedSigma { low, high }
            | Rejection::AveragedSigma { low, high }
            | Rejection::LinearFit { low, high } => {
                check_positive("rejection low", low)?;
                check_positive("rejection high", high)?;
            }
            Rejection::CcdNoise {
                gain,
                read_noise,
                scale_noise,
                low,
                high,
            } => {
                check_positive("ccd gain", gain)?;
                check_range("ccd read noise", read_noise, 0.0, f32::MAX)?;
                check_range("ccd scale noise", scale_noise, 0.0, 1.0)?;
                check_positive("rejection low", low)?;
                check_positive("rejection high", high)?;
            }
        }

        check_range("range low", self.range_low, 0.0, 1.0)?;
        check_range("range high", self.range_high, 0.0, 1.0)?;
        if self.range_clip_low && self.range_clip_high && self.range_low >= self.range_high {
            return Err(Error::InvalidParameter {
                name: "range low",
                message: format!(
                    "must be below range high ({} >= {})",
                    self.range_low, self.range_high
                ),
            });
        }

        check_range("MRS minimum data fraction", self.mrs_min_data_fraction, 0.0, 1.0)?;
        check_positive("file thread overload", self.file_thread_overload)?;

        Ok(())
    }
}

fn check_positive(name: &'static str, value: f32) -> Result<(), Error> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            message: format!("must be positive, got {value}"),
        })
    }
}

fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> Result<(), Error> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            message: format!("must be in [{min}, {max}], got {value}"),
        })
    }
}
