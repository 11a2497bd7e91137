//! Raw-batch source consumed by the read stage.

use crate::buffer::BufferPair;
use crate::error::Result;

/// Streams successive raw batches out of a corpus.
///
/// [`read`](Reader::read) fills `out.data` with the raw bytes of the next
/// `batch_size` items packed back-to-back (recording their boundaries via
/// [`Buffer::push_item`](crate::buffer::Buffer::push_item)) and `out.targets`
/// with the matching target rows, each exactly the target width. A reader may
/// wrap the corpus boundary internally to satisfy a full batch; epoch
/// accounting is the reader's business, not the pipeline's.
///
/// An error return is unrecoverable: the read stage terminates and the
/// pipeline surfaces the failure from `Loader::next`.
pub trait Reader: Send {
    /// Fill `out` with the next raw batch.
    fn read(&mut self, out: &mut BufferPair) -> Result<()>;

    /// Return to the start of the stream, replaying the same item order.
    fn reset(&mut self);
}
