//! Two-slot bounded ring of [`BufferPair`]s — the stage handoff primitive.
//!
//! One pool sits between each pair of pipeline stages. The writer checks a
//! pair out of the write slot, fills it without holding the pool mutex, and
//! commits it; the reader checks the queued pair out of the read slot and
//! releases it once consumed. Count and index bookkeeping live under a single
//! mutex; the pair's bytes are never touched while that mutex is held.
//!
//! Shutdown is a pool-level condition rather than repeated prodding of the
//! condition variables: after [`close`](BufferPool::close), writers observe
//! end-of-stream immediately while readers first drain any queued pairs.

use std::sync::{Condvar, Mutex};

use crate::buffer::BufferPair;
use crate::error::Result;

const SLOTS: usize = 2;

struct Ring {
    slots: [Option<BufferPair>; SLOTS],
    read: usize,
    write: usize,
    count: usize,
    closed: bool,
}

impl Ring {
    fn assert_invariants(&self) {
        debug_assert!(self.count <= SLOTS);
        debug_assert!(self.read < SLOTS);
        debug_assert!(self.write < SLOTS);
    }
}

/// Bounded two-slot queue of buffer pairs with blocking handoff.
pub struct BufferPool {
    state: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BufferPool {
    /// Allocate a pool whose two slots each hold a `(data_size, target_size)`
    /// pair; `pinned` propagates to every constituent buffer.
    pub fn new(data_size: usize, target_size: usize, pinned: bool) -> Result<Self> {
        let slots = [
            Some(BufferPair::alloc(data_size, target_size, pinned)?),
            Some(BufferPair::alloc(data_size, target_size, pinned)?),
        ];
        Ok(Self {
            state: Mutex::new(Ring {
                slots,
                read: 0,
                write: 0,
                count: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Check the write-slot pair out for filling.
    ///
    /// Blocks while the pool is full. Returns `None` once the pool is closed;
    /// a closed pool accepts no new batches.
    pub fn acquire_write(&self) -> Option<BufferPair> {
        let mut ring = self.state.lock().unwrap();
        while !ring.closed && ring.count == SLOTS {
            ring = self.not_full.wait(ring).unwrap();
        }
        if ring.closed {
            return None;
        }
        let write = ring.write;
        let pair = ring.slots[write].take();
        debug_assert!(pair.is_some(), "write slot already checked out");
        pair
    }

    /// Queue a filled pair: return it to the write slot, advance the write
    /// index, and wake one reader.
    pub fn commit_write(&self, pair: BufferPair) {
        {
            let mut ring = self.state.lock().unwrap();
            let write = ring.write;
            debug_assert!(ring.slots[write].is_none());
            ring.slots[write] = Some(pair);
            ring.write = (write + 1) % SLOTS;
            ring.count += 1;
            ring.assert_invariants();
        }
        self.not_empty.notify_one();
    }

    /// Return a checked-out write pair without queueing it (abandoned batch).
    pub fn abort_write(&self, pair: BufferPair) {
        let mut ring = self.state.lock().unwrap();
        let write = ring.write;
        debug_assert!(ring.slots[write].is_none());
        ring.slots[write] = Some(pair);
    }

    /// Check the oldest queued pair out for consumption.
    ///
    /// Blocks while the pool is empty. After [`close`](Self::close), queued
    /// pairs continue to drain in order; `None` marks end-of-stream.
    pub fn acquire_read(&self) -> Option<BufferPair> {
        let mut ring = self.state.lock().unwrap();
        while ring.count == 0 {
            if ring.closed {
                return None;
            }
            ring = self.not_empty.wait(ring).unwrap();
        }
        let read = ring.read;
        let pair = ring.slots[read].take();
        debug_assert!(pair.is_some(), "read slot already checked out");
        pair
    }

    /// Release a consumed pair: return it to the read slot, advance the read
    /// index, and wake one writer.
    pub fn release_read(&self, pair: BufferPair) {
        {
            let mut ring = self.state.lock().unwrap();
            let read = ring.read;
            debug_assert!(ring.slots[read].is_none());
            ring.slots[read] = Some(pair);
            ring.read = (read + 1) % SLOTS;
            debug_assert!(ring.count > 0);
            ring.count -= 1;
            ring.assert_invariants();
        }
        self.not_full.notify_one();
    }

    /// Close the pool and wake every waiter.
    ///
    /// Idempotent. Writers fail fast; readers drain then observe `None`.
    pub fn close(&self) {
        {
            let mut ring = self.state.lock().unwrap();
            ring.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Number of queued pairs, in `0..=2`.
    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// Whether no pairs are queued.
    pub fn is_empty(&self) -> bool {
        self.queued() == 0
    }

    /// Whether both slots are queued.
    pub fn is_full(&self) -> bool {
        self.queued() == SLOTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(4, 1, false).unwrap())
    }

    fn tag(pool: &BufferPool, marker: u8) {
        let mut pair = pool.acquire_write().unwrap();
        pair.data.bytes_mut()[0] = marker;
        pool.commit_write(pair);
    }

    #[test]
    fn test_new_pool_is_empty() {
        let p = pool();
        assert!(p.is_empty());
        assert!(!p.is_full());
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_fifo_order() {
        let p = pool();
        tag(&p, 1);
        tag(&p, 2);
        assert!(p.is_full());

        let a = p.acquire_read().unwrap();
        assert_eq!(a.data.bytes()[0], 1);
        p.release_read(a);

        let b = p.acquire_read().unwrap();
        assert_eq!(b.data.bytes()[0], 2);
        p.release_read(b);
        assert!(p.is_empty());
    }

    #[test]
    fn test_count_tracks_checkout() {
        let p = pool();
        tag(&p, 7);
        assert_eq!(p.queued(), 1);

        // Checked out for read still counts until released.
        let pair = p.acquire_read().unwrap();
        assert_eq!(p.queued(), 1);
        p.release_read(pair);
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_writer_blocks_when_full() {
        let p = pool();
        tag(&p, 1);
        tag(&p, 2);

        let (tx, rx) = mpsc::channel();
        let p2 = p.clone();
        let handle = thread::spawn(move || {
            let pair = p2.acquire_write().unwrap();
            tx.send(()).unwrap();
            p2.commit_write(pair);
        });

        // Writer must not get through while both slots are queued.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let pair = p.acquire_read().unwrap();
        p.release_read(pair);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let p = pool();
        let p2 = p.clone();
        let handle = thread::spawn(move || p2.acquire_read().is_none());
        thread::sleep(Duration::from_millis(50));
        p.close();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_close_drains_queued_pairs() {
        let p = pool();
        tag(&p, 9);
        p.close();

        // Writers fail fast once closed.
        assert!(p.acquire_write().is_none());

        // Readers drain what was queued before end-of-stream.
        let pair = p.acquire_read().unwrap();
        assert_eq!(pair.data.bytes()[0], 9);
        p.release_read(pair);
        assert!(p.acquire_read().is_none());
    }

    #[test]
    fn test_abort_write_leaves_queue_untouched() {
        let p = pool();
        let pair = p.acquire_write().unwrap();
        p.abort_write(pair);
        assert!(p.is_empty());

        // The slot is reusable after an abort.
        tag(&p, 3);
        let pair = p.acquire_read().unwrap();
        assert_eq!(pair.data.bytes()[0], 3);
        p.release_read(pair);
    }
}
