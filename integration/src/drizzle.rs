//! Drizzle data export.
//!
//! Every source file may carry a drizzle data file written by the
//! registration stage. Integration appends its own blocks to it: the file's
//! location estimates (`m`), the reference location estimates (`m0`), scale
//! factors (`s`), weights relative to the reference (`w`) and the coordinates
//! of low (`Rl`) and high (`Rh`) rejected pixels, one group per channel.
//! Blocks left there by a previous integration are replaced.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::config::Roi;
use crate::file_set::{FileSet, IntegrationFile, RejectionCoordinates};
use crate::report::format_general;

/// Block tags written by integration.
const INTEGRATION_TAGS: [&str; 6] = ["m", "m0", "s", "w", "Rl", "Rh"];

/// Destination of drizzle integration data.
pub trait DrizzleSink: Sync {
    /// Stores `text` for the source file `source`, whose drizzle data lives
    /// at `drizzle`.
    fn export(&self, source: &Path, drizzle: &Path, text: &str) -> io::Result<()>;
}

/// Rewrites drizzle data files in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDrizzleSink;

impl DrizzleSink for FileDrizzleSink {
    fn export(&self, _source: &Path, drizzle: &Path, text: &str) -> io::Result<()> {
        let existing = fs::read_to_string(drizzle)?;
        let mut data = strip_integration_blocks(&existing)?;
        if data.trim().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid drizzle data",
            ));
        }
        data.push_str(text);
        fs::write(drizzle, data)
    }
}

/// Removes integration blocks from drizzle data text, keeping everything else
/// verbatim.
pub fn strip_integration_blocks(text: &str) -> io::Result<String> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "unbalanced drizzle data block");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let tag_start = rest[..open]
            .rfind(|c: char| !c.is_ascii_alphanumeric())
            .map_or(0, |i| i + 1);

        let mut depth = 0usize;
        let mut close = None;
        for (i, c) in rest[open..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth = depth.checked_sub(1).ok_or_else(invalid)?;
                    if depth == 0 {
                        close = Some(open + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(invalid)?;

        out.push_str(&rest[..tag_start]);
        if !INTEGRATION_TAGS.contains(&&rest[tag_start..open]) {
            out.push_str(&rest[tag_start..=close]);
        }
        rest = &rest[close + 1..];
    }
    if rest.contains('}') {
        return Err(invalid());
    }
    out.push_str(rest);
    Ok(out)
}

/// Integration data of one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct DrizzleData {
    pub location: Vec<f64>,
    pub reference_location: Vec<f64>,
    pub scale: Vec<f64>,
    /// Weights relative to the reference file.
    pub weight: Vec<f64>,
    /// Rejected pixel coordinates in source image coordinates.
    pub rejected_low: RejectionCoordinates,
    pub rejected_high: RejectionCoordinates,
}

impl DrizzleData {
    pub fn new(
        file: &IntegrationFile,
        reference: &IntegrationFile,
        channels: usize,
        roi: Roi,
    ) -> Self {
        let to_source = |coordinates: &RejectionCoordinates| -> RejectionCoordinates {
            coordinates
                .iter()
                .map(|c| c.iter().map(|&(x, y)| (x + roi.left, y + roi.top)).collect())
                .collect()
        };
        Self {
            location: per_channel(channels, |c| file.location(c)),
            reference_location: per_channel(channels, |c| reference.location(c)),
            scale: per_channel(channels, |c| file.scale(c)),
            weight: per_channel(channels, |c| file.weight(c) / reference.weight(c)),
            rejected_low: to_source(file.drizzle_low_rejections()),
            rejected_high: to_source(file.drizzle_high_rejections()),
        }
    }

    /// Text representation appended to drizzle data files.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        write_values(&mut text, "m", &self.location);
        write_values(&mut text, "m0", &self.reference_location);
        write_values(&mut text, "s", &self.scale);
        write_values(&mut text, "w", &self.weight);
        write_coordinates(&mut text, "Rl", &self.rejected_low);
        write_coordinates(&mut text, "Rh", &self.rejected_high);
        text
    }
}

fn per_channel(channels: usize, f: impl Fn(usize) -> f64) -> Vec<f64> {
    (0..channels).map(f).collect()
}

fn write_values(text: &mut String, tag: &str, values: &[f64]) {
    let values: Vec<String> = values.iter().map(|&v| format_general(v, 16)).collect();
    let _ = write!(text, "{tag}{{{}}}", values.join(","));
}

fn write_coordinates(text: &mut String, tag: &str, coordinates: &RejectionCoordinates) {
    text.push_str(tag);
    text.push('{');
    for channel in coordinates {
        let points: Vec<String> = channel.iter().map(|(x, y)| format!("{x},{y}")).collect();
        let _ = write!(text, "{{{}}}", points.join(","));
    }
    text.push('}');
}

/// Outcome of a drizzle data export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrizzleSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Exports the integration data of every file of `file_set` through `sink`.
///
/// Failures are logged and counted; they never abort the run.
pub fn export_drizzle_data(file_set: &FileSet, sink: &dyn DrizzleSink) -> DrizzleSummary {
    let mut summary = DrizzleSummary::default();
    let reference = file_set.reference();
    for file in file_set.files() {
        let Some(drizzle) = file.drizzle_path() else {
            tracing::warn!(path = %file.path().display(), "Missing drizzle data file path");
            summary.failed += 1;
            continue;
        };

        let text = DrizzleData::new(file, reference, file_set.channels(), file_set.roi()).to_text();
        match sink.export(file.path(), drizzle, &text) {
            Ok(()) => summary.succeeded += 1,
            Err(err) => {
                tracing::warn!(
                    path = %drizzle.display(),
                    error = %err,
                    "Failed to update drizzle data file"
                );
                summary.failed += 1;
            }
        }
    }
    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Drizzle data: {} succeeded, {} errors",
        summary.succeeded,
        summary.failed
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> DrizzleData {
        DrizzleData {
            location: vec![0.25],
            reference_location: vec![0.5],
            scale: vec![1.5],
            weight: vec![0.75],
            rejected_low: vec![vec![(1, 2), (3, 4)]],
            rejected_high: vec![vec![]],
        }
    }

    // ========== Text ==========

    #[test]
    fn test_text_blocks() {
        assert_eq!(
            sample_data().to_text(),
            "m{0.25}m0{0.5}s{1.5}w{0.75}Rl{{1,2,3,4}}Rh{{}}"
        );
    }

    #[test]
    fn test_text_uses_full_precision_per_channel() {
        let data = DrizzleData {
            location: vec![0.1, 1.0 / 3.0],
            reference_location: vec![1.0, 2.0],
            scale: vec![1.0, 1.0],
            weight: vec![1.0, 1.0],
            rejected_low: vec![vec![], vec![(0, 0)]],
            rejected_high: vec![vec![], vec![]],
        };
        let text = data.to_text();
        assert!(text.starts_with("m{0.1,0.3333333333333333}m0{1,2}"), "{text}");
        assert!(text.ends_with("Rl{{}{0,0}}Rh{{}{}}"), "{text}");
    }

    // ========== Block filtering ==========

    #[test]
    fn test_strip_keeps_registration_blocks() {
        let text = "P{1,2}T{{0.5,1}{2,3}}m{0.1}Rl{{1,2}}V{3}";
        assert_eq!(strip_integration_blocks(text).unwrap(), "P{1,2}T{{0.5,1}{2,3}}V{3}");
    }

    #[test]
    fn test_strip_distinguishes_tags_by_full_name() {
        let text = "ms{1}m0{2}mx{3}";
        assert_eq!(strip_integration_blocks(text).unwrap(), "ms{1}mx{3}");
    }

    #[test]
    fn test_strip_rejects_unbalanced_braces() {
        assert!(strip_integration_blocks("P{1,2").is_err());
        assert!(strip_integration_blocks("P{1}}").is_err());
    }

    // ========== File sink ==========

    #[test]
    fn test_file_sink_replaces_previous_integration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.xdrz");
        fs::write(&path, "P{1,2}m{9}w{9}").unwrap();

        FileDrizzleSink
            .export(Path::new("frame.fits"), &path, "m{0.5}")
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "P{1,2}m{0.5}");

        FileDrizzleSink
            .export(Path::new("frame.fits"), &path, "m{0.25}")
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "P{1,2}m{0.25}");
    }

    #[test]
    fn test_file_sink_refuses_empty_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.xdrz");
        fs::write(&path, "m{1}s{1}").unwrap();
        let err = FileDrizzleSink
            .export(Path::new("frame.fits"), &path, "m{0.5}")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_file_sink_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDrizzleSink
            .export(Path::new("frame.fits"), &dir.path().join("none.xdrz"), "m{1}")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
