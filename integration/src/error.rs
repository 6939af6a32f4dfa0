//! Error types for integration runs.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::source::RasterInfo;

/// Errors that abort an integration run.
///
/// Configuration errors are raised before any file is touched; file errors
/// name the offending path. Numerical degeneracies inside pixel rejection are
/// never reported through this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Image integration requires at least three images; only {count} enabled")]
    TooFewImages { count: usize },

    #[error("Linear fit rejection requires at least five images; only {count} enabled")]
    TooFewImagesForLinearFit { count: usize },

    #[error("Empty ROI defined")]
    EmptyRoi,

    #[error("Invalid ROI coordinates")]
    InvalidRoi,

    #[error("Empty weight keyword name")]
    EmptyWeightKeyword,

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error("No such file: {path}")]
    NoSuchFile { path: PathBuf },

    #[error("Failed to open image '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read image '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: Incompatible image geometry: expected {expected:?}, got {actual:?}")]
    IncompatibleGeometry {
        path: PathBuf,
        expected: RasterInfo,
        actual: RasterInfo,
    },

    #[error(
        "{path}: Invalid combination of file formats with and without incremental read capabilities"
    )]
    IncrementalMismatch { path: PathBuf },

    #[error("{path}: Zero or insignificant signal detected (empty image?)")]
    InsignificantSignal { path: PathBuf },

    #[error("{path}: No way to know the exposure time")]
    MissingExposure { path: PathBuf },

    #[error("{path} (channel #{channel}): Unable to compute noise estimate")]
    NoiseEstimate { path: PathBuf, channel: usize },

    #[error("{path}: The file format cannot store keywords")]
    KeywordsUnsupported { path: PathBuf },

    #[error("{path}: Nonexistent or invalid weight keyword '{keyword}'")]
    InvalidWeightKeyword { path: PathBuf, keyword: String },

    #[error("{path}: Missing drizzle data file path")]
    MissingDrizzlePath { path: PathBuf },

    #[error("File cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Integration cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_images_message() {
        let err = Error::TooFewImages { count: 2 };
        assert!(err.to_string().contains("at least three"));
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn test_file_open_error_keeps_source() {
        let err = Error::FileOpen {
            path: PathBuf::from("/data/light_001.fits"),
            source: io::Error::new(io::ErrorKind::NotFound, "file not found"),
        };
        assert!(err.to_string().contains("/data/light_001.fits"));
        assert!(err.to_string().contains("file not found"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_geometry_mismatch_message() {
        let err = Error::IncompatibleGeometry {
            path: PathBuf::from("b.fits"),
            expected: RasterInfo {
                width: 100,
                height: 80,
                channels: 1,
                is_color: false,
            },
            actual: RasterInfo {
                width: 120,
                height: 80,
                channels: 1,
                is_color: false,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("b.fits"));
        assert!(msg.contains("100"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn test_noise_estimate_message_names_channel() {
        let err = Error::NoiseEstimate {
            path: PathBuf::from("c.fits"),
            channel: 2,
        };
        assert!(err.to_string().contains("channel #2"));
    }

    #[test]
    fn test_cache_error_converts() {
        let err: Error = CacheError::NoSuchFile {
            path: PathBuf::from("gone.fits"),
        }
        .into();
        assert!(matches!(err, Error::Cache(_)));
        assert!(err.to_string().contains("gone.fits"));
    }
}
