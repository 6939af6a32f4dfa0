//! Integration report: rejection counts, noise evaluation, description of the
//! run and provenance keywords for the integrated image.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::config::{Combination, IntegrationConfig, Rejection, Roi, WeightMode};
use crate::drizzle::DrizzleSummary;

const HISTORY_PREFIX: &str = "ImageIntegration.";

// ============================================================================
// Number formatting
// ============================================================================

/// `v` formatted like C's `%.{precision}e`: at least two exponent digits with
/// an explicit sign.
pub fn format_exp(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return non_finite(v);
    }
    let s = format!("{v:.precision$e}");
    let (mantissa, exp) = s.split_once('e').unwrap_or((s.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
}

/// `v` formatted like C's `%.{precision}g`: `precision` significant digits,
/// trailing zeros removed, scientific notation for very small or large
/// magnitudes.
pub fn format_general(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return non_finite(v);
    }
    if v == 0.0 {
        return "0".to_string();
    }
    let p = precision.max(1);
    let s = format!("{v:.prec$e}", prec = p - 1);
    let exp: i32 = s
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);

    if exp < -4 || exp >= p as i32 {
        let exp_form = format_exp(v, p - 1);
        let (mantissa, exp) = exp_form.split_once('e').unwrap_or((exp_form.as_str(), "+00"));
        format!("{}e{exp}", trim_fraction(mantissa))
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        trim_fraction(&format!("{v:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn non_finite(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v > 0.0 {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}

fn join_channels(noise: &[ChannelNoise], f: impl Fn(&ChannelNoise) -> String) -> String {
    noise.iter().map(f).collect::<Vec<_>>().join(" ")
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * count as f64 / total as f64
    }
}

// ============================================================================
// Keywords
// ============================================================================

/// A metadata keyword for the integrated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub name: String,
    pub value: String,
    pub comment: String,
}

impl Keyword {
    pub fn new(name: &str, value: impl Into<String>, comment: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        }
    }

    pub fn history(text: impl Into<String>) -> Self {
        Self {
            name: "HISTORY".to_string(),
            value: String::new(),
            comment: text.into(),
        }
    }

    fn integration_history(item: &str, value: impl std::fmt::Display) -> Self {
        Self::history(format!("{HISTORY_PREFIX}{item}: {value}"))
    }
}

// ============================================================================
// Description
// ============================================================================

/// Human readable description of the options of a run. Empty items do not
/// apply to the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionItems {
    pub pixel_combination: String,
    pub output_normalization: String,
    pub weight_mode: String,
    pub scale_estimator: String,
    pub range_rejection: String,
    pub pixel_rejection: String,
    pub rejection_normalization: String,
    pub rejection_clippings: String,
    pub rejection_parameters: String,
    pub region_of_interest: String,
}

impl DescriptionItems {
    pub fn from_config(config: &IntegrationConfig) -> Self {
        let mut items = Self {
            pixel_combination: if config.generate_integrated_image {
                config.combination.to_string()
            } else {
                "disabled".to_string()
            },
            scale_estimator: config.scale_estimator.to_string(),
            pixel_rejection: config.rejection.to_string(),
            ..Self::default()
        };

        if config.generate_integrated_image {
            items.output_normalization = config.normalization.to_string();
        }
        if config.combination == Combination::Average {
            items.weight_mode = match config.weight_mode {
                WeightMode::Keyword => format!("custom keyword: {}", config.weight_keyword),
                mode => mode.to_string(),
            };
        }

        let mut range = Vec::new();
        if config.range_clip_low {
            range.push(format!("range_low={:.6}", config.range_low));
        }
        if config.range_clip_high {
            range.push(format!("range_high={:.6}", config.range_high));
        }
        items.range_rejection = range.join(" ");

        if !config.rejection.is_none() {
            let yes_no = |b: bool| if b { "yes" } else { "no" };
            items.rejection_normalization = config.rejection_normalization.to_string();
            items.rejection_clippings = format!(
                "low={} high={}",
                yes_no(config.clip_low),
                yes_no(config.clip_high)
            );
            items.rejection_parameters = rejection_parameters(&config.rejection);
        }

        if let Some(Roi {
            left,
            top,
            width,
            height,
        }) = config.roi
        {
            items.region_of_interest =
                format!("left={left}, top={top}, width={width}, height={height}");
        }
        items
    }

    fn entries(&self) -> [(&'static str, &'static str, &str); 10] {
        [
            ("Pixel combination ......... ", "pixelCombination", self.pixel_combination.as_str()),
            ("Output normalization ...... ", "outputNormalization", self.output_normalization.as_str()),
            ("Weighting mode ............ ", "weightMode", self.weight_mode.as_str()),
            ("Scale estimator ........... ", "scaleEstimator", self.scale_estimator.as_str()),
            ("Range rejection ........... ", "rangeRejection", self.range_rejection.as_str()),
            ("Pixel rejection ........... ", "pixelRejection", self.pixel_rejection.as_str()),
            ("Rejection normalization ... ", "rejectionNormalization", self.rejection_normalization.as_str()),
            ("Rejection clippings ....... ", "rejectionClippings", self.rejection_clippings.as_str()),
            ("Rejection parameters ...... ", "rejectionParameters", self.rejection_parameters.as_str()),
            ("Region of interest ........ ", "regionOfInterest", self.region_of_interest.as_str()),
        ]
    }

    /// One line per applicable item.
    pub fn to_text(&self) -> String {
        self.entries()
            .iter()
            .filter(|(_, _, value)| !value.is_empty())
            .map(|(label, _, value)| format!("{label}{value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One history keyword per applicable item.
    pub fn history_keywords(&self) -> Vec<Keyword> {
        self.entries()
            .iter()
            .filter(|(_, _, value)| !value.is_empty())
            .map(|(_, item, value)| Keyword::integration_history(item, value))
            .collect()
    }
}

fn rejection_parameters(rejection: &Rejection) -> String {
    match *rejection {
        Rejection::None => String::new(),
        Rejection::MinMax { low, high } => format!("clip_low={low} clip_high={high}"),
        Rejection::Percentile { low, high } => format!("pc_low={low:.3} pc_high={high:.3}"),
        Rejection::Sigma { low, high }
        | Rejection::WinsorizedSigma { low, high }
        | Rejection::AveragedSigma { low, high } => {
            format!("sigma_low={low:.3} sigma_high={high:.3}")
        }
        Rejection::LinearFit { low, high } => format!("lfit_low={low:.3} lfit_high={high:.3}"),
        Rejection::CcdNoise {
            gain,
            read_noise,
            scale_noise,
            ..
        } => format!("gain={gain:.2} read_noise={read_noise:.2} scale_noise={scale_noise:.2}"),
    }
}

// ============================================================================
// Report
// ============================================================================

/// Rejected sample counts of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionCounts {
    pub low: u64,
    pub high: u64,
    pub range_low: u64,
    pub range_high: u64,
}

impl RejectionCounts {
    /// Low rejections, statistical and range.
    pub fn total_low(&self) -> u64 {
        self.low + self.range_low
    }

    pub fn total_high(&self) -> u64 {
        self.high + self.range_high
    }

    pub fn reported_low(&self, with_range: bool) -> u64 {
        if with_range { self.total_low() } else { self.low }
    }

    pub fn reported_high(&self, with_range: bool) -> u64 {
        if with_range { self.total_high() } else { self.high }
    }

    pub fn add(&mut self, other: &RejectionCounts) {
        self.low += other.low;
        self.high += other.high;
        self.range_low += other.range_low;
        self.range_high += other.range_high;
    }
}

/// Per-file results, one value per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub path: PathBuf,
    pub weight: Vec<f64>,
    pub scale: Vec<f64>,
    /// Reference location minus the file's location.
    pub zero_offset: Vec<f64>,
    pub rejected: Vec<RejectionCounts>,
}

/// Noise evaluation of one channel of the integrated image.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelNoise {
    pub noise: f64,
    pub scale: f64,
    pub location: f64,
    pub snr: f64,
    pub reference_reduction: f64,
    pub median_reduction: f64,
}

/// Pedestal shared by the source files.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Pedestal {
    #[default]
    None,
    Consistent(f64),
    /// Files carry different pedestals; no output pedestal is declared.
    Inconsistent,
}

impl Pedestal {
    /// Aggregates file pedestals: the first nonzero one, unless another
    /// file disagrees.
    pub fn aggregate(pedestals: impl IntoIterator<Item = f64>) -> Self {
        let mut result = Self::None;
        for p in pedestals {
            result = match result {
                Self::None if p != 0.0 => Self::Consistent(p),
                Self::Consistent(q) if q != p => return Self::Inconsistent,
                r => r,
            };
        }
        result
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Self::Consistent(p) if p > 0.0 => Some(p),
            _ => None,
        }
    }
}

/// Identifiers of the rasters produced by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputIdentifiers {
    pub integration: Option<String>,
    pub low_rejection_map: Option<String>,
    pub high_rejection_map: Option<String>,
    pub slope_map: Option<String>,
}

/// Everything a run reports besides the output rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationReport {
    pub channels: usize,
    /// Pixels per channel of the integrated region.
    pub pixels: u64,
    /// `pixels` times the number of files.
    pub total_pixels: u64,
    pub total_rejected: Vec<RejectionCounts>,
    pub files: Vec<FileReport>,
    /// Range rejections are included in the rejection table.
    pub report_range_rejection: bool,
    pub noise: Option<Vec<ChannelNoise>>,
    pub pedestal: Pedestal,
    pub description: DescriptionItems,
    pub keywords: Vec<Keyword>,
    pub output_ids: OutputIdentifiers,
    pub drizzle: Option<DrizzleSummary>,
}

impl IntegrationReport {
    /// Per-file and total rejection counts of `channel`.
    pub fn rejection_table(&self, channel: usize) -> String {
        let with_range = self.report_range_rejection;
        let mut text = String::new();
        let mut line = |label: &str, counts: &RejectionCounts, total: u64| {
            let low = counts.reported_low(with_range);
            let high = counts.reported_high(with_range);
            let _ = writeln!(
                text,
                "{label:>5} : {:9} {:7.3}% ({low:9} + {high:9} = {:7.3}% + {:7.3}%)",
                low + high,
                percent(low + high, total),
                percent(low, total),
                percent(high, total),
            );
        };
        for (i, file) in self.files.iter().enumerate() {
            line(&(i + 1).to_string(), &file.rejected[channel], self.pixels);
        }
        line("Total", &self.total_rejected[channel], self.total_pixels);
        text
    }

    /// Console summary: description, rejection tables and noise evaluation.
    pub fn summary_text(&self) -> String {
        let mut text = self.description.to_text();
        text.push_str("\n\nPixel rejection counts:\n");
        for c in 0..self.channels {
            if self.channels > 1 {
                let _ = writeln!(text, "Channel #{c}");
            }
            text.push_str(&self.rejection_table(c));
        }

        if let Some(noise) = &self.noise {
            let rows = [
                ("Gaussian noise estimates  ", join_channels(noise, |n| format_exp(n.noise, 4))),
                ("Scale estimates           ", join_channels(noise, |n| format_exp(n.scale, 4))),
                ("Location estimates        ", join_channels(noise, |n| format_exp(n.location, 4))),
                ("SNR estimates             ", join_channels(noise, |n| format_exp(n.snr, 4))),
                (
                    "Reference noise reduction ",
                    join_channels(noise, |n| format!("{:.4}", n.reference_reduction)),
                ),
                (
                    "Median noise reduction    ",
                    join_channels(noise, |n| format!("{:.4}", n.median_reduction)),
                ),
            ];
            text.push('\n');
            for (label, values) in rows {
                let _ = writeln!(text, "{label}: {values}");
            }
        }
        text
    }

    /// Provenance keywords for the integrated image.
    pub fn provenance_keywords(&self, rejection_active: bool) -> Vec<Keyword> {
        let mut keywords = vec![Keyword::history("Integration with ImageIntegration process")];
        keywords.extend(self.description.history_keywords());
        keywords.push(Keyword::integration_history("numberOfImages", self.files.len()));
        keywords.push(Keyword::integration_history("totalPixels", self.total_pixels));

        if rejection_active {
            let totals = |count: fn(&RejectionCounts) -> u64| {
                self.total_rejected
                    .iter()
                    .map(|t| {
                        let n = count(t);
                        format!("{n}({:.3}%)", percent(n, self.total_pixels))
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            keywords.push(Keyword::integration_history(
                "totalRejectedLow",
                totals(RejectionCounts::total_low),
            ));
            keywords.push(Keyword::integration_history(
                "totalRejectedHigh",
                totals(RejectionCounts::total_high),
            ));
        }

        if let Some(noise) = &self.noise {
            let items = [
                ("finalNoiseEstimates", join_channels(noise, |n| format_exp(n.noise, 4))),
                ("finalScaleEstimates", join_channels(noise, |n| format_exp(n.scale, 4))),
                ("finalLocationEstimates", join_channels(noise, |n| format_exp(n.location, 4))),
                (
                    "referenceNoiseReductions",
                    join_channels(noise, |n| format!("{:.4}", n.reference_reduction)),
                ),
                (
                    "medianNoiseReductions",
                    join_channels(noise, |n| format!("{:.4}", n.median_reduction)),
                ),
            ];
            for (item, values) in items {
                keywords.push(Keyword::integration_history(item, values));
            }
        }

        if let Some(pedestal) = self.pedestal.value() {
            let value = format_general(pedestal, 4);
            keywords.push(Keyword::integration_history(
                "outputPedestal",
                format!("{value} DN"),
            ));
            keywords.push(Keyword::new(
                "PEDESTAL",
                value,
                "Value in DN added to enforce positivity",
            ));
        }

        if let Some(noise) = &self.noise {
            for (c, n) in noise.iter().enumerate() {
                keywords.push(Keyword::new(
                    &format!("NOISE{c:02}"),
                    format_exp(n.noise, 4),
                    &format!("Gaussian noise estimate for channel #{c}"),
                ));
            }
        }
        keywords
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(files: usize, channels: usize) -> IntegrationReport {
        let pixels = 100;
        IntegrationReport {
            channels,
            pixels,
            total_pixels: pixels * files as u64,
            total_rejected: vec![RejectionCounts::default(); channels],
            files: (0..files)
                .map(|i| FileReport {
                    path: PathBuf::from(format!("frame_{i}.fits")),
                    weight: vec![1.0; channels],
                    scale: vec![1.0; channels],
                    zero_offset: vec![0.0; channels],
                    rejected: vec![RejectionCounts::default(); channels],
                })
                .collect(),
            report_range_rejection: false,
            noise: None,
            pedestal: Pedestal::None,
            description: DescriptionItems::default(),
            keywords: vec![],
            output_ids: OutputIdentifiers::default(),
            drizzle: None,
        }
    }

    fn history_texts(keywords: &[Keyword]) -> Vec<&str> {
        keywords
            .iter()
            .filter(|k| k.name == "HISTORY")
            .map(|k| k.comment.as_str())
            .collect()
    }

    // ========== Formatting ==========

    #[test]
    fn test_format_exp() {
        assert_eq!(format_exp(0.00125, 4), "1.2500e-03");
        assert_eq!(format_exp(12345.0, 2), "1.23e+04");
        assert_eq!(format_exp(0.0, 4), "0.0000e+00");
        assert_eq!(format_exp(-2.5e-120, 1), "-2.5e-120");
    }

    #[test]
    fn test_format_general() {
        assert_eq!(format_general(0.25, 16), "0.25");
        assert_eq!(format_general(1.0, 16), "1");
        assert_eq!(format_general(100.0, 4), "100");
        assert_eq!(format_general(123456.0, 4), "1.235e+05");
        assert_eq!(format_general(0.00001234, 4), "1.234e-05");
        assert_eq!(format_general(0.0001234, 4), "0.0001234");
        assert_eq!(format_general(-3.5, 4), "-3.5");
        assert_eq!(format_general(f64::NAN, 4), "nan");
    }

    // ========== Description ==========

    #[test]
    fn test_description_of_sigma_clipping() {
        let config = IntegrationConfig::sigma_clipped(4.0, 2.0);
        let items = DescriptionItems::from_config(&config);
        assert_eq!(items.pixel_combination, "average");
        assert_eq!(items.output_normalization, "additive + scaling");
        assert_eq!(items.weight_mode, "noise evaluation");
        assert_eq!(items.scale_estimator, "iterative k-sigma / BWMV");
        assert_eq!(items.range_rejection, "range_low=0.000000");
        assert_eq!(items.pixel_rejection, "sigma clipping");
        assert_eq!(items.rejection_normalization, "scale + zero offset");
        assert_eq!(items.rejection_clippings, "low=yes high=yes");
        assert_eq!(items.rejection_parameters, "sigma_low=4.000 sigma_high=2.000");
        assert!(items.region_of_interest.is_empty());
    }

    #[test]
    fn test_description_without_rejection() {
        let config = IntegrationConfig {
            combination: Combination::Median,
            generate_integrated_image: false,
            range_clip_low: false,
            range_clip_high: true,
            roi: Some(Roi::new(1, 2, 30, 40)),
            ..IntegrationConfig::default()
        };
        let items = DescriptionItems::from_config(&config);
        assert_eq!(items.pixel_combination, "disabled");
        assert!(items.output_normalization.is_empty());
        assert!(items.weight_mode.is_empty());
        assert_eq!(items.range_rejection, "range_high=0.980000");
        assert_eq!(items.pixel_rejection, "none");
        assert!(items.rejection_parameters.is_empty());
        assert_eq!(items.region_of_interest, "left=1, top=2, width=30, height=40");
    }

    #[test]
    fn test_rejection_parameter_strings() {
        assert_eq!(rejection_parameters(&Rejection::min_max()), "clip_low=1 clip_high=1");
        assert_eq!(rejection_parameters(&Rejection::percentile()), "pc_low=0.200 pc_high=0.100");
        assert_eq!(rejection_parameters(&Rejection::linear_fit()), "lfit_low=5.000 lfit_high=2.500");
        assert_eq!(
            rejection_parameters(&Rejection::ccd_noise()),
            "gain=1.00 read_noise=10.00 scale_noise=0.00"
        );
    }

    #[test]
    fn test_custom_keyword_weighting() {
        let config = IntegrationConfig {
            weight_mode: WeightMode::Keyword,
            weight_keyword: "SNRWEIGHT".to_string(),
            ..IntegrationConfig::default()
        };
        let items = DescriptionItems::from_config(&config);
        assert_eq!(items.weight_mode, "custom keyword: SNRWEIGHT");
    }

    #[test]
    fn test_description_text_skips_empty_items() {
        let items = DescriptionItems {
            pixel_combination: "median".to_string(),
            pixel_rejection: "none".to_string(),
            ..DescriptionItems::default()
        };
        assert_eq!(
            items.to_text(),
            "Pixel combination ......... median\nPixel rejection ........... none"
        );
        assert_eq!(
            history_texts(&items.history_keywords()),
            vec![
                "ImageIntegration.pixelCombination: median",
                "ImageIntegration.pixelRejection: none"
            ]
        );
    }

    // ========== Rejection table ==========

    #[test]
    fn test_rejection_table_lines() {
        let mut r = report(2, 1);
        r.files[0].rejected[0] = RejectionCounts {
            low: 2,
            high: 3,
            range_low: 5,
            range_high: 0,
        };
        r.total_rejected[0] = r.files[0].rejected[0];

        let table = r.rejection_table(0);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "    1 :         5   5.000% (        2 +         3 =   2.000% +   3.000%)"
        );
        assert!(lines[2].starts_with("Total :         5   2.500%"));

        r.report_range_rejection = true;
        assert!(r.rejection_table(0).starts_with("    1 :        10  10.000%"));
    }

    // ========== Pedestal ==========

    #[test]
    fn test_pedestal_aggregation() {
        assert_eq!(Pedestal::aggregate([0.0, 0.0]), Pedestal::None);
        assert_eq!(Pedestal::aggregate([0.0, 100.0, 100.0]), Pedestal::Consistent(100.0));
        assert_eq!(Pedestal::aggregate([100.0, 0.0]), Pedestal::Inconsistent);
        assert_eq!(Pedestal::aggregate([100.0, 50.0]), Pedestal::Inconsistent);
        assert_eq!(Pedestal::Inconsistent.value(), None);
    }

    // ========== Keywords ==========

    #[test]
    fn test_provenance_keywords() {
        let mut r = report(3, 2);
        r.description.pixel_combination = "average".to_string();
        r.total_rejected[0].low = 3;
        r.total_rejected[1].range_high = 30;
        r.noise = Some(vec![
            ChannelNoise {
                noise: 0.001,
                reference_reduction: 1.5,
                ..ChannelNoise::default()
            };
            2
        ]);
        r.pedestal = Pedestal::Consistent(100.0);

        let keywords = r.provenance_keywords(true);
        let history = history_texts(&keywords);
        assert_eq!(history[0], "Integration with ImageIntegration process");
        assert!(history.contains(&"ImageIntegration.pixelCombination: average"));
        assert!(history.contains(&"ImageIntegration.numberOfImages: 3"));
        assert!(history.contains(&"ImageIntegration.totalPixels: 300"));
        assert!(history.contains(&"ImageIntegration.totalRejectedLow: 3(1.000%) 0(0.000%)"));
        assert!(history.contains(&"ImageIntegration.totalRejectedHigh: 0(0.000%) 30(10.000%)"));
        assert!(history.contains(&"ImageIntegration.finalNoiseEstimates: 1.0000e-03 1.0000e-03"));
        assert!(history.contains(&"ImageIntegration.referenceNoiseReductions: 1.5000 1.5000"));
        assert!(history.contains(&"ImageIntegration.outputPedestal: 100 DN"));

        let noise01 = keywords.iter().find(|k| k.name == "NOISE01").unwrap();
        assert_eq!(noise01.value, "1.0000e-03");
        assert_eq!(noise01.comment, "Gaussian noise estimate for channel #1");
        let pedestal = keywords.iter().find(|k| k.name == "PEDESTAL").unwrap();
        assert_eq!(pedestal.value, "100");
    }

    #[test]
    fn test_keywords_without_rejection_or_noise() {
        let keywords = report(3, 1).provenance_keywords(false);
        assert!(keywords.iter().all(|k| k.name == "HISTORY"));
        assert!(
            !history_texts(&keywords)
                .iter()
                .any(|t| t.contains("totalRejected"))
        );
    }
}
