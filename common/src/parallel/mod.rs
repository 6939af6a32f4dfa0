//! Parallel processing utilities.
//!
//! Work is split into one contiguous block of rows per rayon worker, so every
//! worker owns a disjoint slice of each buffer it touches.

use rayon::prelude::*;

#[cfg(test)]
mod tests;

/// Number of rows in each worker block for a buffer of `height` rows.
#[inline]
pub fn rows_per_block(height: usize) -> usize {
    let threads = rayon::current_num_threads().max(1);
    height.div_ceil(threads).max(1)
}

// ============================================================================
// Row views
// ============================================================================

/// A mutable slice viewed as consecutive rows of `row_len` elements.
pub struct Rows<'a, T> {
    data: &'a mut [T],
    row_len: usize,
}

/// View `data` as rows of `row_len` elements.
///
/// # Panics
///
/// Panics if `row_len` is zero or does not divide `data.len()`.
pub fn rows<T>(data: &mut [T], row_len: usize) -> Rows<'_, T> {
    assert!(row_len > 0, "row_len must be > 0");
    assert_eq!(
        data.len() % row_len,
        0,
        "Slice length must be a multiple of row_len"
    );
    Rows { data, row_len }
}

impl<'a, T: Send + 'a> Rows<'a, T> {
    pub fn height(&self) -> usize {
        self.data.len() / self.row_len
    }

    /// Parallel iterator over `(first_row, block)` pairs, one block per worker.
    pub fn par_blocks(self) -> impl IndexedParallelIterator<Item = (usize, &'a mut [T])> + 'a {
        let block_rows = rows_per_block(self.height());
        self.data
            .par_chunks_mut(block_rows * self.row_len)
            .enumerate()
            .map(move |(i, block)| (i * block_rows, block))
    }

    /// Pair with another row view of the same height.
    pub fn zip<U: Send + 'a>(self, other: Rows<'a, U>) -> ZippedRows2<'a, T, U> {
        assert_eq!(
            self.height(),
            other.height(),
            "Zipped row views must have equal height"
        );
        ZippedRows2(self, other)
    }
}

/// Two row views of equal height.
pub struct ZippedRows2<'a, A, B>(Rows<'a, A>, Rows<'a, B>);

impl<'a, A: Send + 'a, B: Send + 'a> ZippedRows2<'a, A, B> {
    pub fn zip<C: Send + 'a>(self, other: Rows<'a, C>) -> ZippedRows3<'a, A, B, C> {
        assert_eq!(
            self.0.height(),
            other.height(),
            "Zipped row views must have equal height"
        );
        ZippedRows3(self.0, self.1, other)
    }

    pub fn par_blocks(
        self,
    ) -> impl IndexedParallelIterator<Item = (usize, (&'a mut [A], &'a mut [B]))> + 'a {
        let block_rows = rows_per_block(self.0.height());
        let (a, b) = (self.0, self.1);
        a.data
            .par_chunks_mut(block_rows * a.row_len)
            .zip(b.data.par_chunks_mut(block_rows * b.row_len))
            .enumerate()
            .map(move |(i, pair)| (i * block_rows, pair))
    }
}

/// Three row views of equal height.
pub struct ZippedRows3<'a, A, B, C>(Rows<'a, A>, Rows<'a, B>, Rows<'a, C>);

impl<'a, A: Send + 'a, B: Send + 'a, C: Send + 'a> ZippedRows3<'a, A, B, C> {
    pub fn par_blocks(
        self,
    ) -> impl IndexedParallelIterator<Item = (usize, (&'a mut [A], &'a mut [B], &'a mut [C]))> + 'a
    {
        let block_rows = rows_per_block(self.0.height());
        let (a, b, c) = (self.0, self.1, self.2);
        a.data
            .par_chunks_mut(block_rows * a.row_len)
            .zip(b.data.par_chunks_mut(block_rows * b.row_len))
            .zip(c.data.par_chunks_mut(block_rows * c.row_len))
            .enumerate()
            .map(move |(i, ((a, b), c))| (i * block_rows, (a, b, c)))
    }
}

// ============================================================================
// Bounded parallel map
// ============================================================================

/// Maps `f` over `items` in parallel with at most `max_concurrent` items in flight.
///
/// Results keep the input order. Stops after the first batch containing an
/// error; `between_batches` runs before every batch and may abort the map.
///
/// # Panics
///
/// Panics if `max_concurrent` is 0.
pub fn try_par_map_limited<T, R, E, F, G>(
    items: &[T],
    max_concurrent: usize,
    mut between_batches: G,
    f: F,
) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(&T) -> Result<R, E> + Sync,
    G: FnMut(usize) -> Result<(), E>,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(max_concurrent) {
        between_batches(results.len())?;
        let chunk_results: Result<Vec<R>, E> = chunk.par_iter().map(&f).collect();
        results.extend(chunk_results?);
    }
    Ok(results)
}
