//! Pixel stacks: the samples of every source file at one output pixel.
//!
//! A [`StackStrip`] holds the stacks of a run of ROI rows, `width` stacks per
//! row and `files` entries per stack, in file order when loaded.

use std::cmp::Ordering;

use common::parallel;
use rayon::prelude::*;

use crate::file_set::FileSet;

/// Percentage of available memory the pixel stacks may use.
pub const MEMORY_PERCENT: u64 = 75;

/// One sample of a pixel stack.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelStackEntry {
    /// Sample as seen by the rejection algorithms, possibly normalized.
    pub value: f32,
    /// Sample as read from the source file.
    pub raw: f32,
    /// Index of the source file.
    pub index: u32,
    pub reject_low: bool,
    pub reject_high: bool,
    pub range_low: bool,
    pub range_high: bool,
}

impl PixelStackEntry {
    /// Entry for sample `v` of file `index`. Non-finite samples read as 0.
    pub fn new(v: f32, index: usize) -> Self {
        let v = if v.is_finite() { v } else { 0.0 };
        Self {
            value: v,
            raw: v,
            index: index as u32,
            ..Self::default()
        }
    }

    pub fn is_statistically_rejected(&self) -> bool {
        self.reject_low || self.reject_high
    }

    pub fn is_range_rejected(&self) -> bool {
        self.range_low || self.range_high
    }

    pub fn is_rejected(&self) -> bool {
        self.is_statistically_rejected() || self.is_range_rejected()
    }

    pub fn is_low_rejected(&self) -> bool {
        self.reject_low || self.range_low
    }

    pub fn is_high_rejected(&self) -> bool {
        self.reject_high || self.range_high
    }

    pub fn file(&self) -> usize {
        self.index as usize
    }
}

/// Kept entries first, each group by ascending value.
pub fn compare_by_value(a: &PixelStackEntry, b: &PixelStackEntry) -> Ordering {
    a.is_rejected()
        .cmp(&b.is_rejected())
        .then_with(|| a.value.total_cmp(&b.value))
}

/// Ascending raw value.
pub fn compare_by_raw(a: &PixelStackEntry, b: &PixelStackEntry) -> Ordering {
    a.raw.total_cmp(&b.raw)
}

pub fn sort_by_value(stack: &mut [PixelStackEntry]) {
    stack.sort_unstable_by(compare_by_value);
}

// ============================================================================
// Sizing
// ============================================================================

/// Bytes one pixel stack occupies, including its kept counter and slope.
pub fn stack_bytes(files: usize, linear_fit: bool) -> usize {
    files * size_of::<PixelStackEntry>()
        + size_of::<usize>()
        + if linear_fit { size_of::<f32>() } else { 0 }
}

/// Number of stack rows processed per batch for a budget of `budget_mb` MiB.
///
/// Never below 1 and never above `buffer_rows`. The budget is further capped
/// by the memory the system reports as available.
pub fn stack_rows(
    budget_mb: usize,
    width: usize,
    files: usize,
    linear_fit: bool,
    buffer_rows: usize,
) -> usize {
    stack_rows_with_memory(
        budget_mb,
        width,
        files,
        linear_fit,
        buffer_rows,
        available_memory(),
    )
}

/// [`stack_rows`] with an explicit amount of available memory in bytes.
pub fn stack_rows_with_memory(
    budget_mb: usize,
    width: usize,
    files: usize,
    linear_fit: bool,
    buffer_rows: usize,
    available_memory: u64,
) -> usize {
    let usable = available_memory.saturating_mul(MEMORY_PERCENT) / 100;
    let budget = (budget_mb as u64).saturating_mul(1024 * 1024);
    let budget = if usable > 0 { budget.min(usable) } else { budget };

    let row_bytes = (width as u64).saturating_mul(stack_bytes(files, linear_fit) as u64);
    let rows = if row_bytes == 0 {
        buffer_rows
    } else {
        (budget / row_bytes) as usize
    };
    rows.clamp(1, buffer_rows.max(1))
}

fn available_memory() -> u64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

// ============================================================================
// Strip
// ============================================================================

/// Pixel stacks of up to `capacity` rows.
#[derive(Debug)]
pub struct StackStrip {
    width: usize,
    files: usize,
    rows: usize,
    entries: Vec<PixelStackEntry>,
    /// Kept entries per stack.
    counts: Vec<usize>,
    /// Linear fit slope per stack.
    slopes: Vec<f32>,
    with_slopes: bool,
}

impl StackStrip {
    pub fn new(width: usize, files: usize, capacity: usize, with_slopes: bool) -> Self {
        let stacks = width * capacity;
        Self {
            width,
            files,
            rows: capacity,
            entries: vec![PixelStackEntry::default(); stacks * files],
            counts: vec![0; stacks],
            slopes: vec![0.0; stacks],
            with_slopes,
        }
    }

    /// Builds a strip directly from stack samples, one `Vec` per stack in
    /// file order.
    pub fn from_samples(width: usize, samples: &[Vec<f32>], with_slopes: bool) -> Self {
        let files = samples.first().map_or(0, Vec::len);
        let rows = samples.len() / width.max(1);
        let mut strip = Self::new(width, files, rows, with_slopes);
        for (s, stack) in samples.iter().enumerate() {
            assert_eq!(stack.len(), files, "Every stack needs one sample per file");
            for (i, &v) in stack.iter().enumerate() {
                strip.entries[s * files + i] = PixelStackEntry::new(v, i);
            }
            strip.counts[s] = files;
        }
        strip
    }

    /// Fills the first `rows` stack rows from the rows of the current file set
    /// strip starting at `first_row`.
    ///
    /// # Panics
    ///
    /// Panics if `rows` exceeds the capacity of the strip.
    pub fn load(&mut self, file_set: &FileSet, first_row: usize, rows: usize) {
        let capacity = self.counts.len() / self.width.max(1);
        assert!(rows <= capacity, "{rows} rows exceed strip capacity {capacity}");
        self.rows = rows;

        let (width, files) = (self.width, self.files);
        let stacks = rows * width;
        let entries = &mut self.entries[..stacks * files];
        let counts = &mut self.counts[..stacks];
        counts.fill(files);
        self.slopes[..stacks].fill(0.0);

        parallel::rows(entries, width * files)
            .par_blocks()
            .for_each(|(first, block)| {
                for (r, row) in block.chunks_exact_mut(width * files).enumerate() {
                    for f in 0..files {
                        let samples = file_set.row(f, first_row + first + r);
                        for (x, &v) in samples.iter().enumerate() {
                            row[x * files + f] = PixelStackEntry::new(v, f);
                        }
                    }
                }
            });
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Entries per stack.
    pub fn files(&self) -> usize {
        self.files
    }

    /// Rows currently loaded.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn stack_count(&self) -> usize {
        self.rows * self.width
    }

    /// Slopes are meaningful, i.e. the strip feeds a slope map.
    pub fn has_slopes(&self) -> bool {
        self.with_slopes
    }

    /// Stack of the pixel at column `x` of loaded row `r`.
    pub fn stack(&self, r: usize, x: usize) -> &[PixelStackEntry] {
        let start = (r * self.width + x) * self.files;
        &self.entries[start..start + self.files]
    }

    pub fn stack_mut(&mut self, r: usize, x: usize) -> &mut [PixelStackEntry] {
        let start = (r * self.width + x) * self.files;
        &mut self.entries[start..start + self.files]
    }

    pub fn count(&self, r: usize, x: usize) -> usize {
        self.counts[r * self.width + x]
    }

    pub fn slope(&self, r: usize, x: usize) -> f32 {
        self.slopes[r * self.width + x]
    }

    /// Row views of the loaded entries and kept counts.
    pub(crate) fn row_views(
        &mut self,
    ) -> (
        parallel::Rows<'_, PixelStackEntry>,
        parallel::Rows<'_, usize>,
    ) {
        let stacks = self.rows * self.width;
        (
            parallel::rows(
                &mut self.entries[..stacks * self.files],
                self.width * self.files,
            ),
            parallel::rows(&mut self.counts[..stacks], self.width),
        )
    }

    /// Loaded rows as parallel blocks of `(first_row, (entries, counts,
    /// slopes))`.
    pub(crate) fn par_row_blocks_with_slopes(
        &mut self,
    ) -> impl IndexedParallelIterator<
        Item = (
            usize,
            (&mut [PixelStackEntry], &mut [usize], &mut [f32]),
        ),
    > + '_ {
        let stacks = self.rows * self.width;
        let files = self.files;
        parallel::rows(&mut self.entries[..stacks * files], self.width * files)
            .zip(parallel::rows(&mut self.counts[..stacks], self.width))
            .zip(parallel::rows(&mut self.slopes[..stacks], self.width))
            .par_blocks()
    }

    /// Iterates `(stack, kept)` over the loaded stacks in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (&[PixelStackEntry], usize)> {
        let stacks = self.rows * self.width;
        self.entries[..stacks * self.files]
            .chunks_exact(self.files.max(1))
            .zip(&self.counts[..stacks])
            .map(|(stack, &n)| (stack, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegrationConfig;
    use crate::progress::{CancelToken, ProgressCallback};
    use crate::source::{MemoryOpener, MemoryRaster};
    use crate::testing;

    // ========== Entries ==========

    #[test]
    fn test_non_finite_samples_read_as_zero() {
        let e = PixelStackEntry::new(f32::NAN, 3);
        assert_eq!((e.value, e.raw, e.file()), (0.0, 0.0, 3));
        assert!(!e.is_rejected());
        assert_eq!(PixelStackEntry::new(f32::INFINITY, 0).value, 0.0);
    }

    #[test]
    fn test_flag_groups() {
        let mut e = PixelStackEntry::new(0.5, 0);
        e.range_high = true;
        assert!(e.is_rejected() && e.is_range_rejected() && e.is_high_rejected());
        assert!(!e.is_statistically_rejected() && !e.is_low_rejected());
    }

    #[test]
    fn test_value_order_puts_rejected_last() {
        let mut stack: Vec<PixelStackEntry> = [0.4, 0.1, 0.3, 0.2]
            .iter()
            .enumerate()
            .map(|(i, &v)| PixelStackEntry::new(v, i))
            .collect();
        stack[1].range_low = true;
        sort_by_value(&mut stack);
        let values: Vec<f32> = stack.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0.2, 0.3, 0.4, 0.1]);
    }

    // ========== Sizing ==========

    #[test]
    fn test_stack_rows_follow_budget() {
        let gib = 1u64 << 34;
        let bytes = stack_bytes(10, false) as u64;
        let rows = stack_rows_with_memory(1, 100, 10, false, 10_000, gib);
        assert_eq!(rows as u64, (1024 * 1024) / (100 * bytes));
    }

    #[test]
    fn test_stack_rows_bounds() {
        let gib = 1u64 << 34;
        // Tiny budget degrades to a single row.
        assert_eq!(stack_rows_with_memory(0, 4000, 50, true, 100, gib), 1);
        // Large budget stops at the buffered rows.
        assert_eq!(stack_rows_with_memory(1024, 16, 3, false, 7, gib), 7);
        // Available memory caps the budget.
        let capped = stack_rows_with_memory(1024, 100, 10, false, 1_000_000, 1 << 20);
        let bytes = stack_bytes(10, false) as u64;
        assert_eq!(capped as u64, (1u64 << 20) * 3 / 4 / (100 * bytes));
    }

    #[test]
    fn test_linear_fit_adds_slope_bytes() {
        assert_eq!(
            stack_bytes(5, true),
            stack_bytes(5, false) + size_of::<f32>()
        );
    }

    // ========== Loading ==========

    #[test]
    fn test_load_transposes_rows_into_stacks() {
        let (w, h) = (5, 4);
        let mut opener = MemoryOpener::new();
        for i in 0..3 {
            let plane: Vec<f32> = (0..w * h).map(|p| 0.1 + (i * 100 + p) as f32 * 1e-3).collect();
            opener.insert(testing::frame_path(i), MemoryRaster::new(w, h, vec![plane]));
        }
        let config = IntegrationConfig {
            weight_mode: crate::config::WeightMode::DontCare,
            evaluate_noise: false,
            use_cache: false,
            ..IntegrationConfig::default()
        }
        .with_images(testing::frame_paths(3));
        let mut set = FileSet::open(
            &config,
            &opener,
            None,
            &CancelToken::new(),
            &ProgressCallback::None,
        )
        .unwrap();
        set.update_buffers(0, 0).unwrap();

        let mut strip = StackStrip::new(w, 3, h, false);
        strip.load(&set, 1, 3);
        assert_eq!(strip.rows(), 3);
        assert_eq!(strip.stack_count(), 15);
        for r in 0..3 {
            for x in 0..w {
                assert_eq!(strip.count(r, x), 3);
                let stack = strip.stack(r, x);
                for (f, e) in stack.iter().enumerate() {
                    assert_eq!(e.file(), f);
                    let expected = 0.1 + (f * 100 + (r + 1) * w + x) as f32 * 1e-3;
                    assert_eq!(e.raw, expected);
                    assert_eq!(e.value, expected);
                }
            }
        }
    }

    #[test]
    fn test_from_samples() {
        let strip = StackStrip::from_samples(2, &[vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]], true);
        assert_eq!((strip.width(), strip.rows(), strip.files()), (2, 1, 3));
        assert!(strip.has_slopes());
        assert_eq!(strip.stack(0, 1)[2].raw, 0.6);
        assert_eq!(strip.iter().count(), 2);
    }
}
