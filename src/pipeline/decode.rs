//! Decode fan-out/fan-in stage and device upload.
//!
//! N persistent worker threads each decode a fixed, disjoint index range of
//! every batch; a manager thread moves buffer pairs between the pools,
//! releases the workers onto each batch, transposes the assembled result,
//! and copies it into the device's alternating slots.
//!
//! Workers never lock around byte work. They are released with per-worker
//! start flags and report back through a completion counter, both guarded by
//! one stage-private mutex; because that same mutex orders a worker's final
//! increment against the manager's observation of it, every worker's output
//! bytes are visible to the manager by the time the counter reaches N.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::buffer::BufferPair;
use crate::device::{Device, DEVICE_SLOTS};
use crate::error::{Error, Result};
use crate::media::Media;
use crate::pipeline::status::PipelineStatus;
use crate::pool::BufferPool;
use crate::transpose::transpose;

/// Byte geometry of one batch, fixed at start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchGeometry {
    pub batch_size: usize,
    pub datum_size: usize,
    pub target_size: usize,
    pub elem_size: usize,
}

/// One worker's slice of the batch: item indices `[start, end)` plus the
/// byte offsets those indices map to in the output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Partition {
    pub start: usize,
    pub end: usize,
    pub data_offset: usize,
    pub target_offset: usize,
    pub target_span: usize,
}

/// Split `batch_size` items across `workers` into disjoint covering ranges.
///
/// Every worker gets `ceil(batch_size / workers)` items except the last,
/// which takes the remainder. The caller must pass a normalized worker count
/// (see `worker_count_for` in the loader) so the last range is never empty.
pub(crate) fn partitions(
    batch_size: usize,
    workers: usize,
    datum_size: usize,
    target_size: usize,
) -> Vec<Partition> {
    debug_assert!(workers >= 1);
    debug_assert!(workers <= batch_size);
    let per_worker = batch_size.div_ceil(workers);
    debug_assert!((workers - 1) * per_worker < batch_size, "idle trailing worker");
    (0..workers)
        .map(|i| {
            let start = i * per_worker;
            let end = ((i + 1) * per_worker).min(batch_size);
            Partition {
                start,
                end,
                data_offset: start * datum_size,
                target_offset: start * target_size,
                target_span: (end - start) * target_size,
            }
        })
        .collect()
}

/// Raw views of the two checked-out buffer pairs for the batch in flight.
///
/// Published by the manager before it releases the workers and cleared once
/// all of them have reported completion. The manager holds both pairs
/// checked out of their pools for that whole window, and the pointed-to heap
/// allocations stay at stable addresses while the pair values move, so the
/// pointers remain valid for every worker write.
#[derive(Clone, Copy)]
struct BatchTask {
    input: *const BufferPair,
    out_data: *mut u8,
    out_data_len: usize,
    out_targets: *mut u8,
    out_targets_len: usize,
}

// SAFETY: the pointers are dereferenced only between the start signal and
// the completion signal for one batch, while the manager keeps the referents
// alive; workers write exclusively through the disjoint windows their
// partitions derive, so no two threads alias a byte.
unsafe impl Send for BatchTask {}

struct Signals {
    start: Vec<bool>,
    ended: usize,
    corrupt: bool,
    done: bool,
    task: Option<BatchTask>,
}

struct Shared {
    signals: Mutex<Signals>,
    started: Condvar,
    ended: Condvar,
}

/// N decode workers plus the manager thread.
pub(crate) struct DecodePool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    manager: Option<JoinHandle<()>>,
}

impl DecodePool {
    /// Spawn the workers and the manager.
    ///
    /// The manager initializes the device before touching any batch; an init
    /// failure is recorded on `status` and the stage shuts itself down.
    pub(crate) fn spawn<M: Media + 'static, D: Device + 'static>(
        worker_count: usize,
        geometry: BatchGeometry,
        input_pool: Arc<BufferPool>,
        output_pool: Arc<BufferPool>,
        media: Arc<M>,
        device: Arc<D>,
        status: Arc<PipelineStatus>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            signals: Mutex::new(Signals {
                start: vec![false; worker_count],
                ended: 0,
                corrupt: false,
                done: false,
                task: None,
            }),
            started: Condvar::new(),
            ended: Condvar::new(),
        });

        let mut pool = Self {
            shared: shared.clone(),
            workers: Vec::with_capacity(worker_count),
            manager: None,
        };

        let parts = partitions(
            geometry.batch_size,
            worker_count,
            geometry.datum_size,
            geometry.target_size,
        );
        for (id, part) in parts.into_iter().enumerate() {
            let shared = shared.clone();
            let media = media.clone();
            let spawned = thread::Builder::new()
                .name(format!("loadr-decode-{id}"))
                .spawn(move || worker_run(id, shared, media, part, geometry));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.stop();
                    return Err(Error::Allocation {
                        reason: format!("failed to spawn decode worker {id}: {e}"),
                    });
                }
            }
        }

        let spawned = thread::Builder::new().name("loadr-manage".to_string()).spawn({
            let shared = shared.clone();
            move || {
                manager_run(
                    shared,
                    input_pool,
                    output_pool,
                    device,
                    status,
                    geometry,
                    worker_count,
                )
            }
        });
        match spawned {
            Ok(handle) => pool.manager = Some(handle),
            Err(e) => {
                pool.stop();
                return Err(Error::Allocation {
                    reason: format!("failed to spawn decode manager: {e}"),
                });
            }
        }

        Ok(pool)
    }

    /// Terminate and join every thread in the stage.
    ///
    /// Both pools must already be closed so the manager cannot be parked in
    /// a pool wait, and so no writer can reacquire a buffer a worker might
    /// still be finishing.
    pub(crate) fn stop(&mut self) {
        {
            let mut signals = self.shared.signals.lock().unwrap();
            signals.done = true;
        }
        self.shared.started.notify_all();
        self.shared.ended.notify_all();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.manager.take() {
            let _ = handle.join();
        }
    }
}

fn worker_run<M: Media>(
    id: usize,
    shared: Arc<Shared>,
    media: Arc<M>,
    part: Partition,
    geometry: BatchGeometry,
) {
    loop {
        // A set start flag wins over `done`: a batch the manager has already
        // released must be carried to completion so the manager can account
        // for every worker before it lets go of the in-flight buffers.
        let task = {
            let mut signals = shared.signals.lock().unwrap();
            loop {
                if signals.start[id] {
                    signals.start[id] = false;
                    break;
                }
                if signals.done {
                    return;
                }
                signals = shared.started.wait(signals).unwrap();
            }
            signals.task
        };

        let ok = match task {
            Some(task) => decode_partition(task, &part, &geometry, media.as_ref()),
            None => false,
        };

        {
            let mut signals = shared.signals.lock().unwrap();
            if !ok {
                signals.corrupt = true;
            }
            signals.ended += 1;
            debug_assert!(signals.ended <= signals.start.len());
        }
        shared.ended.notify_one();
    }
}

/// Decode one worker's index range. Returns `false` to tag the batch corrupt.
fn decode_partition<M: Media>(
    task: BatchTask,
    part: &Partition,
    geometry: &BatchGeometry,
    media: &M,
) -> bool {
    // SAFETY: see `BatchTask` — the referents outlive the batch window and
    // this worker's output ranges are disjoint from every other worker's.
    let input = unsafe { &*task.input };

    let mut offset = part.data_offset;
    for index in part.start..part.end {
        let Some(item) = input.data.item(index) else {
            return false;
        };
        debug_assert!(offset + geometry.datum_size <= task.out_data_len);
        // SAFETY: as above; `[offset, offset + datum_size)` lies inside this
        // worker's data window.
        let dst =
            unsafe { std::slice::from_raw_parts_mut(task.out_data.add(offset), geometry.datum_size) };
        if media.transform(item, dst).is_err() {
            return false;
        }
        offset += geometry.datum_size;
    }

    let src_start = part.start * geometry.target_size;
    if src_start + part.target_span > input.targets.len() {
        return false;
    }
    let src = &input.targets.bytes()[src_start..src_start + part.target_span];
    debug_assert!(part.target_offset + part.target_span <= task.out_targets_len);
    // SAFETY: as above; the target window is this worker's alone.
    let dst = unsafe {
        std::slice::from_raw_parts_mut(task.out_targets.add(part.target_offset), part.target_span)
    };
    dst.copy_from_slice(src);
    true
}

fn manager_run<D: Device>(
    shared: Arc<Shared>,
    input_pool: Arc<BufferPool>,
    output_pool: Arc<BufferPool>,
    device: Arc<D>,
    status: Arc<PipelineStatus>,
    geometry: BatchGeometry,
    worker_count: usize,
) {
    if let Err(e) = device.init() {
        error!(error = %e, "device init failed, pipeline will produce no batches");
        status.fail(e);
        input_pool.close();
        output_pool.close();
        return;
    }
    debug!("device initialized");

    let columns = geometry.datum_size / geometry.elem_size;
    let mut slot = 0usize;
    let mut scratch = Vec::new();
    let mut produced = 0u64;

    while let Some(input) = input_pool.acquire_read() {
        let Some(mut output) = output_pool.acquire_write() else {
            input_pool.release_read(input);
            break;
        };

        // Publish the batch and release every worker onto it.
        {
            let mut signals = shared.signals.lock().unwrap();
            let out_data_len = output.data.len();
            let out_targets_len = output.targets.len();
            signals.task = Some(BatchTask {
                input: &input as *const BufferPair,
                out_data: output.data.bytes_mut().as_mut_ptr(),
                out_data_len,
                out_targets: output.targets.bytes_mut().as_mut_ptr(),
                out_targets_len,
            });
            for flag in signals.start.iter_mut() {
                *flag = true;
            }
        }
        shared.started.notify_all();

        // Fan-in: wait for every worker, then retire the task. Workers
        // finish a released batch even during shutdown, so this wait is
        // bounded and no buffer is let go of while a worker still holds a
        // window into it.
        let (stopping, corrupt) = {
            let mut signals = shared.signals.lock().unwrap();
            while signals.ended < worker_count {
                signals = shared.ended.wait(signals).unwrap();
            }
            signals.ended = 0;
            signals.task = None;
            let corrupt = signals.corrupt;
            signals.corrupt = false;
            (signals.done, corrupt)
        };

        if stopping {
            output_pool.abort_write(output);
            input_pool.release_read(input);
            break;
        }
        if corrupt {
            error!("decode fault, abandoning corrupt batch");
            status.fail(Error::Decode {
                reason: "a decode worker could not transform its items".to_string(),
            });
            output_pool.abort_write(output);
            input_pool.release_read(input);
            input_pool.close();
            output_pool.close();
            break;
        }

        transpose(
            output.data.bytes_mut(),
            geometry.batch_size,
            columns,
            geometry.elem_size,
            &mut scratch,
        );

        let uploaded = device
            .copy_data(slot, output.data.bytes())
            .and_then(|()| device.copy_labels(slot, output.targets.bytes()));
        if let Err(e) = uploaded {
            error!(error = %e, slot, "device upload failed");
            status.fail(e);
            output_pool.abort_write(output);
            input_pool.release_read(input);
            input_pool.close();
            output_pool.close();
            break;
        }
        slot = (slot + 1) % DEVICE_SLOTS;
        produced += 1;

        output_pool.commit_write(output);
        input_pool.release_read(input);
    }

    output_pool.close();
    debug!(produced, "decode manager terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_five_items_three_workers() {
        let parts = partitions(5, 3, 4, 2);
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].start, parts[0].end), (0, 2));
        assert_eq!((parts[1].start, parts[1].end), (2, 4));
        assert_eq!((parts[2].start, parts[2].end), (4, 5));

        assert_eq!(parts[1].data_offset, 8);
        assert_eq!(parts[1].target_offset, 4);
        assert_eq!(parts[1].target_span, 4);
        assert_eq!(parts[2].target_span, 2);
    }

    #[test]
    fn test_partition_covers_batch_disjointly() {
        for (batch, workers) in [(1, 1), (4, 2), (5, 3), (7, 7), (8, 3), (33, 7)] {
            let parts = partitions(batch, workers, 3, 1);
            let mut covered = vec![0usize; batch];
            for p in &parts {
                assert!(p.start < p.end, "empty range in {parts:?}");
                for i in p.start..p.end {
                    covered[i] += 1;
                }
            }
            assert!(
                covered.iter().all(|&c| c == 1),
                "batch {batch} workers {workers}: cover {covered:?}"
            );
        }
    }

    #[test]
    fn test_partition_single_worker_owns_batch() {
        let parts = partitions(6, 1, 2, 1);
        assert_eq!(parts.len(), 1);
        assert_eq!((parts[0].start, parts[0].end), (0, 6));
        assert_eq!(parts[0].target_span, 6);
    }
}
