//! Row partitioning across workers
//!
//! Splits `rows` into contiguous near-equal blocks. The first `rows % workers`
//! blocks get one extra row, so sizes differ by at most one and row order is
//! preserved when blocks are concatenated back in order.

use std::ops::Range;

/// Block sizes for `worker_count` workers
///
/// Returns an empty vector for `worker_count == 0`. Blocks of size zero are
/// produced when there are more workers than rows.
pub fn block_sizes(rows: usize, worker_count: usize) -> Vec<usize> {
    if worker_count == 0 {
        return Vec::new();
    }

    let base = rows / worker_count;
    let remainder = rows % worker_count;

    (0..worker_count)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Contiguous ascending row ranges covering `[0, rows)`
pub fn row_ranges(rows: usize, worker_count: usize) -> Vec<Range<usize>> {
    let mut start = 0;
    block_sizes(rows, worker_count)
        .into_iter()
        .map(|size| {
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}
