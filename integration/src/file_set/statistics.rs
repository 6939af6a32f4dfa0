//! Per-file statistics and the analysis of which ones a run needs.

use serde::{Deserialize, Serialize};

use crate::config::{
    Combination, IntegrationConfig, OutputNormalization, RejectionNormalization, ScaleEstimator,
    WeightMode,
};
use crate::math::statistics::{
    BWMV_K, PBMV_BETA, avg_dev, bend_midvariance, biweight_midvariance, ikss, mad, mean,
    median_mut, qn, sample_in_range, sn,
};

/// Samples at or beyond these limits are excluded from file statistics.
pub const STATISTICS_LOW: f64 = 0.00002;
pub const STATISTICS_HIGH: f64 = 0.99998;

/// Statistics of one source file, one value per channel.
///
/// Every vector is optional: only the statistics a run needs are computed,
/// and cached records accumulate whatever earlier runs needed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStatistics {
    pub mean: Option<Vec<f64>>,
    pub median: Option<Vec<f64>>,
    pub avg_dev: Option<Vec<f64>>,
    pub mad: Option<Vec<f64>>,
    /// Square root of the biweight midvariance.
    pub bwmv: Option<Vec<f64>>,
    /// Square root of the percentage bend midvariance.
    pub pbmv: Option<Vec<f64>>,
    pub sn: Option<Vec<f64>>,
    pub qn: Option<Vec<f64>>,
    pub ikss: Option<Vec<f64>>,
    pub iksl: Option<Vec<f64>>,
    pub noise: Option<Vec<f64>>,
    pub pedestal: f64,
}

impl FileStatistics {
    /// Every present vector has exactly `channels` values.
    pub fn matches_channels(&self, channels: usize) -> bool {
        [
            &self.mean,
            &self.median,
            &self.avg_dev,
            &self.mad,
            &self.bwmv,
            &self.pbmv,
            &self.sn,
            &self.qn,
            &self.ikss,
            &self.iksl,
            &self.noise,
        ]
        .iter()
        .all(|v| v.as_ref().is_none_or(|v| v.len() == channels))
    }

    /// Dispersion vector of the selected scale estimator.
    pub fn dispersion(&self, estimator: ScaleEstimator) -> Option<&[f64]> {
        match estimator {
            ScaleEstimator::AvgDev => self.avg_dev.as_deref(),
            ScaleEstimator::Mad => self.mad.as_deref(),
            ScaleEstimator::BiweightMidvariance => self.bwmv.as_deref(),
            ScaleEstimator::PercentageBendMidvariance => self.pbmv.as_deref(),
            ScaleEstimator::Sn => self.sn.as_deref(),
            ScaleEstimator::Qn => self.qn.as_deref(),
            ScaleEstimator::Ikss => self.ikss.as_deref(),
        }
    }

    /// Location vector matching the selected scale estimator: the IKSS
    /// location for IKSS, the median otherwise.
    pub fn location(&self, estimator: ScaleEstimator) -> Option<&[f64]> {
        if estimator == ScaleEstimator::Ikss {
            self.iksl.as_deref()
        } else {
            self.median.as_deref()
        }
    }
}

/// Which statistics a run needs, derived from its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsNeeds {
    pub noise: bool,
    pub scale: bool,
    pub median: bool,
    pub ikss: bool,
    pub avg_dev: bool,
    pub mean: bool,
    pub mad: bool,
    pub bwmv: bool,
    pub pbmv: bool,
    pub sn: bool,
    pub qn: bool,
}

impl StatisticsNeeds {
    pub fn from_config(config: &IntegrationConfig) -> Self {
        let integrated = config.generate_integrated_image;
        let drizzle = config.generate_drizzle_data;
        let output = config.generates_output();
        let rejecting = !config.rejection.is_none();
        let weight = config.weight_mode;
        let estimator = config.scale_estimator;

        let noise = integrated
            && (config.evaluate_noise
                || config.combination == Combination::Average
                    && weight == WeightMode::NoiseEvaluation)
            || drizzle && weight == WeightMode::NoiseEvaluation;

        let scale = noise
            || output && config.normalization.is_scaling()
            || rejecting && config.rejection_normalization == RejectionNormalization::Scale;

        let median = scale
            || output
                && (config.normalization != OutputNormalization::None
                    || matches!(weight, WeightMode::SignalWeight | WeightMode::MedianWeight))
            || rejecting
                && config.rejection_normalization == RejectionNormalization::EqualizeFluxes;

        Self {
            noise,
            scale,
            median,
            ikss: estimator == ScaleEstimator::Ikss || integrated && config.evaluate_noise,
            avg_dev: estimator == ScaleEstimator::AvgDev
                || output && weight == WeightMode::SignalWeight,
            mean: output && weight == WeightMode::AverageWeight,
            mad: estimator == ScaleEstimator::Mad,
            bwmv: estimator == ScaleEstimator::BiweightMidvariance,
            pbmv: estimator == ScaleEstimator::PercentageBendMidvariance,
            sn: estimator == ScaleEstimator::Sn,
            qn: estimator == ScaleEstimator::Qn,
        }
    }

    /// The needs not yet satisfied by `stats`.
    pub fn missing(&self, stats: &FileStatistics) -> Self {
        Self {
            noise: self.noise && stats.noise.is_none(),
            scale: self.scale,
            median: self.median && stats.median.is_none(),
            ikss: self.ikss && (stats.ikss.is_none() || stats.iksl.is_none()),
            avg_dev: self.avg_dev && stats.avg_dev.is_none(),
            mean: self.mean && stats.mean.is_none(),
            mad: self.mad && stats.mad.is_none(),
            bwmv: self.bwmv && stats.bwmv.is_none(),
            pbmv: self.pbmv && stats.pbmv.is_none(),
            sn: self.sn && stats.sn.is_none(),
            qn: self.qn && stats.qn.is_none(),
        }
    }

    /// Any of the range-limited descriptive statistics must be computed.
    pub fn any_descriptive(&self) -> bool {
        self.mean
            || self.median
            || self.avg_dev
            || self.mad
            || self.bwmv
            || self.pbmv
            || self.sn
            || self.qn
    }

    /// Pixel data must be read to satisfy these needs.
    pub fn any_pixels(&self) -> bool {
        self.any_descriptive() || self.ikss || self.noise
    }
}

/// Descriptive statistics of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct ChannelStatistics {
    pub mean: f64,
    pub median: f64,
    pub avg_dev: f64,
    pub mad: f64,
    pub bwmv: f64,
    pub pbmv: f64,
    pub sn: f64,
    pub qn: f64,
}

/// Computes the descriptive statistics `needs` asks for over the samples of
/// `plane` inside `(STATISTICS_LOW, STATISTICS_HIGH)`. The mean is always
/// computed.
pub(crate) fn channel_statistics(plane: &[f32], needs: &StatisticsNeeds) -> ChannelStatistics {
    let mut samples = sample_in_range(plane, STATISTICS_LOW, STATISTICS_HIGH);
    let mut out = ChannelStatistics {
        mean: mean(&samples),
        ..Default::default()
    };

    if needs.median || needs.avg_dev || needs.mad || needs.bwmv || needs.pbmv {
        let center = median_mut(&mut samples);
        out.median = center;
        if needs.avg_dev {
            out.avg_dev = avg_dev(&samples, center);
        }
        if needs.mad || needs.bwmv {
            out.mad = mad(&samples, center);
        }
        if needs.bwmv {
            out.bwmv = biweight_midvariance(&samples, center, out.mad, BWMV_K).sqrt();
        }
        if needs.pbmv {
            out.pbmv = bend_midvariance(&samples, center, PBMV_BETA).sqrt();
        }
    }
    if needs.sn {
        out.sn = sn(&samples);
    }
    if needs.qn {
        out.qn = qn(&samples);
    }
    out
}

/// IKSS scale and location of one channel over `(0, 1)`.
pub(crate) fn channel_ikss(plane: &[f32]) -> (f64, f64) {
    let est = ikss(plane, 0.0, 1.0);
    (est.scale, est.location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Rejection;

    #[test]
    fn test_default_config_needs() {
        let needs = StatisticsNeeds::from_config(&IntegrationConfig::default());
        // Average + noise weighting + IKSS + noise evaluation.
        assert!(needs.noise);
        assert!(needs.scale);
        assert!(needs.median);
        assert!(needs.ikss);
        assert!(!needs.avg_dev);
        assert!(!needs.mean);
        assert!(!needs.mad && !needs.bwmv && !needs.pbmv && !needs.sn && !needs.qn);
    }

    #[test]
    fn test_plain_average_needs_nothing_expensive() {
        let config = IntegrationConfig {
            evaluate_noise: false,
            scale_estimator: ScaleEstimator::Mad,
            ..IntegrationConfig::plain_average()
        };
        let needs = StatisticsNeeds::from_config(&config);
        assert!(!needs.noise);
        assert!(!needs.scale);
        assert!(!needs.median);
        assert!(!needs.ikss);
        assert!(needs.mad);
        assert!(needs.any_descriptive());
    }

    #[test]
    fn test_equalize_fluxes_needs_median() {
        let config = IntegrationConfig {
            rejection: Rejection::sigma(),
            rejection_normalization: RejectionNormalization::EqualizeFluxes,
            evaluate_noise: false,
            ..IntegrationConfig::plain_average()
        };
        let needs = StatisticsNeeds::from_config(&config);
        assert!(needs.median);
        assert!(!needs.scale);
    }

    #[test]
    fn test_weight_modes_drive_needs() {
        let base = IntegrationConfig {
            evaluate_noise: false,
            ..IntegrationConfig::plain_average()
        };
        let signal = StatisticsNeeds::from_config(&IntegrationConfig {
            weight_mode: WeightMode::SignalWeight,
            ..base.clone()
        });
        assert!(signal.avg_dev && signal.median);

        let average = StatisticsNeeds::from_config(&IntegrationConfig {
            weight_mode: WeightMode::AverageWeight,
            ..base.clone()
        });
        assert!(average.mean);

        // Median combination does not use noise weights.
        let median = StatisticsNeeds::from_config(&IntegrationConfig {
            combination: Combination::Median,
            weight_mode: WeightMode::NoiseEvaluation,
            ..base
        });
        assert!(!median.noise);
    }

    #[test]
    fn test_missing_skips_cached_values() {
        let needs = StatisticsNeeds::from_config(&IntegrationConfig::default());
        let stats = FileStatistics {
            median: Some(vec![0.1]),
            ikss: Some(vec![0.01]),
            iksl: Some(vec![0.1]),
            ..Default::default()
        };
        let missing = needs.missing(&stats);
        assert!(!missing.median);
        assert!(!missing.ikss);
        assert!(missing.noise);
    }

    #[test]
    fn test_channel_count_check() {
        let stats = FileStatistics {
            median: Some(vec![0.1, 0.2, 0.3]),
            noise: Some(vec![0.01, 0.01, 0.01]),
            ..Default::default()
        };
        assert!(stats.matches_channels(3));
        assert!(!stats.matches_channels(1));
        assert!(FileStatistics::default().matches_channels(1));
    }

    #[test]
    fn test_channel_statistics_excludes_saturated_samples() {
        let plane = [0.0f32, 0.2, 0.4, 0.6, 1.0];
        let needs = StatisticsNeeds {
            median: true,
            avg_dev: true,
            ..Default::default()
        };
        let s = channel_statistics(&plane, &needs);
        assert!((s.mean - 0.4).abs() < 1e-7);
        assert!((s.median - 0.4).abs() < 1e-7);
        assert!((s.avg_dev - 0.4 / 3.0).abs() < 1e-7);
    }

    #[test]
    fn test_location_and_dispersion_follow_estimator() {
        let stats = FileStatistics {
            median: Some(vec![0.2]),
            iksl: Some(vec![0.21]),
            ikss: Some(vec![0.01]),
            mad: Some(vec![0.008]),
            ..Default::default()
        };
        assert_eq!(stats.location(ScaleEstimator::Ikss), Some(&[0.21][..]));
        assert_eq!(stats.location(ScaleEstimator::Mad), Some(&[0.2][..]));
        assert_eq!(stats.dispersion(ScaleEstimator::Mad), Some(&[0.008][..]));
        assert_eq!(stats.dispersion(ScaleEstimator::Sn), None);
    }
}
