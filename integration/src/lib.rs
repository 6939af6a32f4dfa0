//! Integration - multi-frame statistical image integration.
//!
//! Combines a set of registered frames of the same scene into one image of
//! higher signal to noise ratio:
//! - Per-file statistics, normalization and weighting, with a persistent cache
//! - Range rejection and eight statistical pixel rejection algorithms
//! - Average, median, minimum and maximum pixel combination
//! - Rejection maps, slope maps, drizzle data and provenance keywords
//!
//! Decoding image files is left to the caller through [`RasterOpener`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use integration::{CancelToken, IntegrationConfig, Integrator, ProgressCallback};
//!
//! let config = IntegrationConfig::winsorized(4.0, 2.0)
//!     .with_images(["light_001.fits", "light_002.fits", "light_003.fits"]);
//! let outcome = Integrator::new(config).integrate(
//!     &opener,
//!     None,
//!     &CancelToken::new(),
//!     &ProgressCallback::None,
//! )?;
//! if let Some(result) = outcome.completed() {
//!     println!("{}", result.report.summary_text());
//! }
//! ```

pub mod cache;
pub mod combination;
pub mod config;
pub mod drizzle;
mod error;
pub mod file_set;
mod integrator;
pub mod math;
pub mod output;
mod progress;
pub mod rejection;
pub mod report;
pub mod source;
pub mod stack;

#[cfg(test)]
mod testing;

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{
    Combination, ImageItem, IntegrationConfig, OutputNormalization, Rejection,
    RejectionNormalization, Roi, ScaleEstimator, WeightMode,
};
pub use error::Error;

// ============================================================================
// Running an integration
// ============================================================================

pub use cache::{CacheError, CacheStore, FileDataCache, JsonFileStore, MemoryStore};
pub use drizzle::{DrizzleSink, DrizzleSummary, FileDrizzleSink};
pub use file_set::FileStatistics;
pub use integrator::{IntegrationResult, Integrator, Outcome};
pub use progress::{
    CancelToken, IntegrationProgress, IntegrationStage, ProgressCallback, report_progress,
};
pub use source::{MemoryOpener, MemoryRaster, RasterInfo, RasterOpener, SourceRaster};

// ============================================================================
// Results
// ============================================================================

pub use output::{MapRaster, OutputRaster, Planes};
pub use report::{IntegrationReport, Keyword, RejectionCounts};
