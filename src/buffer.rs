//! Byte buffers circulated through the pipeline.
//!
//! A [`Buffer`] is a contiguous, fixed-size byte region owned by exactly one
//! holder at a time. Raw-side buffers additionally carry an item table so
//! decode workers can locate the variable-width items a reader packed
//! back-to-back. A [`BufferPair`] bundles the data and target buffers for one
//! in-flight batch.

use crate::error::{Error, Result};

/// A fixed-size byte region with an optional item table.
///
/// `pinned` records that the region is intended for DMA-friendly page-locked
/// memory. Page-locking itself is performed by the accelerator backend that
/// registers the region; host-only pipelines never set it.
pub struct Buffer {
    bytes: Vec<u8>,
    items: Vec<(usize, usize)>,
    fill: usize,
    pinned: bool,
}

impl Buffer {
    /// Allocate a zero-filled buffer of `size` bytes.
    ///
    /// Allocation failure is reported as [`Error::Allocation`] rather than
    /// aborting, so `Loader::start` can surface it.
    pub fn alloc(size: usize, pinned: bool) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|e| Error::Allocation {
                reason: format!("buffer of {size} bytes: {e}"),
            })?;
        bytes.resize(size, 0);
        Ok(Self {
            bytes,
            items: Vec::new(),
            fill: 0,
            pinned,
        })
    }

    /// Allocated length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the buffer is flagged for page-locked memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Full byte region.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Full byte region, mutable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Reset the fill cursor and item table before writing a new raw batch.
    pub fn begin_fill(&mut self) {
        self.fill = 0;
        self.items.clear();
    }

    /// Append one item's bytes and record its boundaries.
    ///
    /// Items are packed back-to-back from the start of the buffer.
    pub fn push_item(&mut self, src: &[u8]) -> Result<()> {
        let end = self.fill + src.len();
        if end > self.bytes.len() {
            return Err(Error::Read {
                reason: format!(
                    "item of {} bytes overflows buffer ({} of {} bytes used)",
                    src.len(),
                    self.fill,
                    self.bytes.len()
                ),
            });
        }
        self.bytes[self.fill..end].copy_from_slice(src);
        self.items.push((self.fill, src.len()));
        self.fill = end;
        Ok(())
    }

    /// Number of items recorded since the last [`begin_fill`](Self::begin_fill).
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Bytes of item `index`, or `None` if no such item was recorded.
    ///
    /// A `None` during decode is the decode-fault condition: the reader did
    /// not deliver the item the partition expects.
    pub fn item(&self, index: usize) -> Option<&[u8]> {
        let &(off, len) = self.items.get(index)?;
        Some(&self.bytes[off..off + len])
    }
}

/// The (data, targets) buffer pair for one in-flight batch.
pub struct BufferPair {
    /// Raw or decoded datum bytes.
    pub data: Buffer,
    /// Packed target rows.
    pub targets: Buffer,
}

impl BufferPair {
    /// Allocate a pair with independent sizes; `pinned` propagates to both
    /// constituent buffers.
    pub fn alloc(data_size: usize, target_size: usize, pinned: bool) -> Result<Self> {
        Ok(Self {
            data: Buffer::alloc(data_size, pinned)?,
            targets: Buffer::alloc(target_size, pinned)?,
        })
    }
}
