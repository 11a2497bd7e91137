//! Post-decode batch transpose.
//!
//! Decode workers produce the batch row-major: `rows` items of `cols`
//! elements each. Training frameworks consume the feature-major layout, so
//! the manager transposes the grid to `cols × rows` before upload. The
//! element width is explicit — transposing bytes of a multi-byte dtype would
//! interleave the bytes within each element.

use rayon::prelude::*;

/// Below this size the scatter loop beats the fork/join overhead.
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Transpose `buf` in place from `(rows, cols)` to `(cols, rows)` with cells
/// of `elem_size` bytes, using `scratch` as the staging area.
///
/// `buf.len()` must equal `rows * cols * elem_size`. The scratch buffer is
/// grown on first use and reused across batches.
///
/// # Panics
///
/// Panics if the buffer length does not match the grid dimensions.
pub fn transpose(buf: &mut [u8], rows: usize, cols: usize, elem_size: usize, scratch: &mut Vec<u8>) {
    assert_eq!(
        buf.len(),
        rows * cols * elem_size,
        "transpose grid does not match buffer length"
    );
    if rows <= 1 || cols <= 1 {
        return;
    }

    scratch.clear();
    scratch.resize(buf.len(), 0);

    let row_bytes = rows * elem_size;
    let src_buf: &[u8] = buf;
    let gather_column = |(c, out_row): (usize, &mut [u8])| {
        for r in 0..rows {
            let src = (r * cols + c) * elem_size;
            out_row[r * elem_size..(r + 1) * elem_size]
                .copy_from_slice(&src_buf[src..src + elem_size]);
        }
    };

    if buf.len() >= PARALLEL_THRESHOLD {
        scratch
            .par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(gather_column);
    } else {
        scratch.chunks_mut(row_bytes).enumerate().for_each(gather_column);
    }

    buf.copy_from_slice(scratch);
}
