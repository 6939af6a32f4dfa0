//! Progress reporting and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::SharedFn;

use crate::error::Error;

/// Progress information for an integration run.
#[derive(Debug, Clone)]
pub struct IntegrationProgress {
    /// Current step (0-based).
    pub current: usize,
    /// Total number of steps.
    pub total: usize,
    pub stage: IntegrationStage,
}

/// Stage of an integration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationStage {
    /// Opening source files and computing their statistics. Steps are files.
    OpeningFiles,
    /// Integrating pixel rows of one channel. Steps are rows.
    Integrating { channel: usize },
    /// Evaluating noise of the integrated image. Steps are channels.
    EvaluatingNoise,
}

/// Callback type for progress reporting.
pub type ProgressCallback = SharedFn<dyn Fn(IntegrationProgress) + Send + Sync>;

/// Report progress using the callback if set.
pub fn report_progress(
    callback: &ProgressCallback,
    current: usize,
    total: usize,
    stage: IntegrationStage,
) {
    if let Some(f) = callback.get() {
        f(IntegrationProgress {
            current,
            total,
            stage,
        });
    }
}

/// Shared cancellation flag, polled between files and between stack batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_report_progress_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = SharedFn::new(Arc::new(move |p: IntegrationProgress| {
            sink.lock().push((p.current, p.total, p.stage));
        }));

        report_progress(&callback, 1, 4, IntegrationStage::OpeningFiles);
        report_progress(&callback, 2, 8, IntegrationStage::Integrating { channel: 1 });

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, 4, IntegrationStage::OpeningFiles));
        assert_eq!(seen[1].2, IntegrationStage::Integrating { channel: 1 });
    }

    #[test]
    fn test_report_progress_without_callback() {
        report_progress(
            &ProgressCallback::default(),
            0,
            1,
            IntegrationStage::EvaluatingNoise,
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
