//! Top-level pipeline orchestrator.
//!
//! Assembles the read stage, the decode pool, and their two buffer pools,
//! and exposes the consumer handshake: `start`, `next`, `reset`, `stop`.
//!
//! # Lifecycle
//!
//! ```ignore
//! let reader = CorpusReader::open("train.ldrc", corpus_config)?;
//! let mut loader = Loader::new(config, reader, RawMedia, HostDevice::new())?;
//! loader.start()?;
//! loop {
//!     loader.next()?;
//!     // consume the uploaded batch through the device's slots
//! }
//! loader.stop();
//! ```

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::info;

use crate::buffer::BufferPair;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};
use crate::media::Media;
use crate::pipeline::{BatchGeometry, DecodePool, PipelineStatus, ReadStage};
use crate::pool::BufferPool;
use crate::reader::Reader;

/// Batch geometry and worker sizing for a [`Loader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Items per batch.
    pub batch_size: usize,
    /// Decoded width of one datum in bytes.
    pub datum_size: usize,
    /// Width of one target row in bytes.
    pub target_size: usize,
    /// Element width the post-decode transpose preserves. Must divide
    /// `datum_size`; 1 transposes raw bytes.
    pub elem_size: usize,
    /// Decode worker count target. Defaults to the available hardware
    /// threads. The batch is spread as evenly as possible across the target,
    /// so fewer workers are spawned when they already cover the batch.
    pub decode_workers: Option<usize>,
}

impl LoaderConfig {
    /// Configuration for `batch_size` items of `datum_size` data bytes and
    /// `target_size` target bytes each.
    pub fn new(batch_size: usize, datum_size: usize, target_size: usize) -> Self {
        Self {
            batch_size,
            datum_size,
            target_size,
            elem_size: 1,
            decode_workers: None,
        }
    }

    pub fn with_elem_size(mut self, elem_size: usize) -> Self {
        self.elem_size = elem_size;
        self
    }

    pub fn with_decode_workers(mut self, workers: usize) -> Self {
        self.decode_workers = Some(workers);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.datum_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "datum_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.target_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "target_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.elem_size == 0 || self.datum_size % self.elem_size != 0 {
            return Err(Error::InvalidArgument {
                arg: "elem_size",
                reason: format!(
                    "{} does not divide datum_size {}",
                    self.elem_size, self.datum_size
                ),
            });
        }
        if self.decode_workers == Some(0) {
            return Err(Error::InvalidArgument {
                arg: "decode_workers",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Spread the batch as evenly as possible across `cores` hardware threads
/// without exceeding the batch size.
fn worker_count_for(batch_size: usize, cores: usize) -> usize {
    let cores = cores.max(1);
    let per_worker = batch_size.div_ceil(cores);
    batch_size.div_ceil(per_worker).min(batch_size)
}

fn default_worker_count(batch_size: usize) -> usize {
    let cores = thread::available_parallelism().map(usize::from).unwrap_or(1);
    worker_count_for(batch_size, cores)
}

struct Pipeline {
    read_pool: Arc<BufferPool>,
    decode_pool: Arc<BufferPool>,
    read_stage: ReadStage,
    decode: DecodePool,
    status: Arc<PipelineStatus>,
}

/// The three-stage loader: reader → decode fan-out → device double buffers.
///
/// Construction stores configuration and collaborators only; `start` brings
/// the threads and buffers up, `stop` tears them down, and `reset` replays
/// the reader's stream from the beginning.
pub struct Loader<R, M, D> {
    config: LoaderConfig,
    reader: Arc<Mutex<R>>,
    media: Arc<M>,
    device: Arc<D>,
    pipeline: Option<Pipeline>,
    current: Option<BufferPair>,
    first: bool,
}

impl<R, M, D> Loader<R, M, D>
where
    R: Reader + 'static,
    M: Media + 'static,
    D: Device + 'static,
{
    /// Store configuration and collaborators. Allocates nothing.
    pub fn new(config: LoaderConfig, reader: R, media: M, device: D) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reader: Arc::new(Mutex::new(reader)),
            media: Arc::new(media),
            device: Arc::new(device),
            pipeline: None,
            current: None,
            first: true,
        })
    }

    /// Bring the pipeline up: allocate both pools, spawn the decode pool,
    /// then the read stage.
    ///
    /// Allocation or spawn failure leaves the loader stopped and
    /// destructible. Starting a running loader is an error.
    pub fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(Error::Pipeline {
                reason: "loader is already started".to_string(),
            });
        }
        self.first = true;
        self.current = None;

        let data_bytes = self.config.batch_size * self.config.datum_size;
        let target_bytes = self.config.batch_size * self.config.target_size;

        let read_pool = Arc::new(BufferPool::new(data_bytes, target_bytes, false)?);
        let pinned = self.device.kind() != DeviceKind::Cpu;
        let decode_pool = Arc::new(BufferPool::new(data_bytes, target_bytes, pinned)?);

        let workers = match self.config.decode_workers {
            Some(target) => worker_count_for(self.config.batch_size, target),
            None => default_worker_count(self.config.batch_size),
        };
        let geometry = BatchGeometry {
            batch_size: self.config.batch_size,
            datum_size: self.config.datum_size,
            target_size: self.config.target_size,
            elem_size: self.config.elem_size,
        };
        let status = Arc::new(PipelineStatus::new());

        let mut decode = DecodePool::spawn(
            workers,
            geometry,
            read_pool.clone(),
            decode_pool.clone(),
            self.media.clone(),
            self.device.clone(),
            status.clone(),
        )?;

        let read_stage = match ReadStage::spawn(read_pool.clone(), self.reader.clone(), status.clone())
        {
            Ok(stage) => stage,
            Err(e) => {
                read_pool.close();
                decode_pool.close();
                decode.stop();
                return Err(e);
            }
        };

        info!(
            batch_size = self.config.batch_size,
            datum_size = self.config.datum_size,
            target_size = self.config.target_size,
            workers,
            pinned,
            "pipeline started"
        );
        self.pipeline = Some(Pipeline {
            read_pool,
            decode_pool,
            read_stage,
            decode,
            status,
        });
        Ok(())
    }

    /// Tear the pipeline down, discarding in-flight batches. A second `stop`
    /// is a no-op.
    pub fn stop(&mut self) {
        if self.shutdown() {
            info!("pipeline stopped");
        }
    }

    /// `stop`, rewind the reader, `start` again.
    pub fn reset(&mut self) -> Result<()> {
        self.stop();
        self.reader.lock().unwrap().reset();
        self.start()
    }

    /// Block until the next decoded batch has been uploaded to the device,
    /// releasing the previously consumed batch first.
    ///
    /// Between two `next` calls exactly one batch is checked out to the
    /// consumer; the device slot it was uploaded to alternates 0, 1, 0, …
    /// If the pipeline hit a fatal error, returns it instead of blocking.
    pub fn next(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(Error::Pipeline {
                reason: "loader is not started".to_string(),
            });
        };

        if self.first {
            self.first = false;
        } else if let Some(previous) = self.current.take() {
            pipeline.decode_pool.release_read(previous);
        }

        match pipeline.decode_pool.acquire_read() {
            Some(pair) => {
                self.current = Some(pair);
                Ok(())
            }
            None => Err(pipeline.status.take_error()),
        }
    }

    /// Copy the next decoded batch into caller-provided buffers and release
    /// it immediately. Testing hook; training loops use [`next`](Self::next)
    /// and read the device slots in place.
    pub fn next_into(&mut self, data: &mut [u8], targets: &mut [u8]) -> Result<()> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Err(Error::Pipeline {
                reason: "loader is not started".to_string(),
            });
        };
        let Some(pair) = pipeline.decode_pool.acquire_read() else {
            return Err(pipeline.status.take_error());
        };
        if data.len() > pair.data.len() || targets.len() > pair.targets.len() {
            let err = Error::InvalidArgument {
                arg: "data",
                reason: "output buffers are larger than a decoded batch".to_string(),
            };
            pipeline.decode_pool.release_read(pair);
            return Err(err);
        }
        data.copy_from_slice(&pair.data.bytes()[..data.len()]);
        targets.copy_from_slice(&pair.targets.bytes()[..targets.len()]);
        pipeline.decode_pool.release_read(pair);
        Ok(())
    }

    /// The shared reader, for inspection and test setup.
    pub fn reader(&self) -> &Arc<Mutex<R>> {
        &self.reader
    }

    /// The media transform.
    pub fn media(&self) -> &Arc<M> {
        &self.media
    }

    /// The upload device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<R, M, D> Loader<R, M, D> {
    /// Close the pools, join every stage thread, and drop the pipeline.
    /// Returns whether a pipeline was running.
    fn shutdown(&mut self) -> bool {
        let Some(mut pipeline) = self.pipeline.take() else {
            return false;
        };
        self.current = None;

        // Closing the read pool stops the read stage and lets the manager
        // run out of input; closing the decode pool unparks it (and any
        // consumer) immediately. Every thread is joined before the pools,
        // and with them the buffers a worker may still be finishing, drop.
        pipeline.read_pool.close();
        pipeline.read_stage.join();
        pipeline.decode_pool.close();
        pipeline.decode.stop();
        true
    }
}

impl<R, M, D> Drop for Loader<R, M, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(LoaderConfig::new(4, 3, 1).validate().is_ok());
        assert!(LoaderConfig::new(0, 3, 1).validate().is_err());
        assert!(LoaderConfig::new(4, 0, 1).validate().is_err());
        assert!(LoaderConfig::new(4, 3, 0).validate().is_err());
    }

    #[test]
    fn test_config_elem_size_must_divide_datum() {
        assert!(LoaderConfig::new(4, 8, 1).with_elem_size(4).validate().is_ok());
        assert!(LoaderConfig::new(4, 8, 1).with_elem_size(3).validate().is_err());
        assert!(LoaderConfig::new(4, 8, 1).with_elem_size(0).validate().is_err());
    }

    #[test]
    fn test_config_worker_bounds() {
        assert!(LoaderConfig::new(4, 3, 1).with_decode_workers(4).validate().is_ok());
        assert!(LoaderConfig::new(4, 3, 1).with_decode_workers(0).validate().is_err());
    }

    #[test]
    fn test_worker_target_never_leaves_an_idle_worker() {
        // ceil(16/5)=4 items per worker covers the batch with 4 workers.
        assert_eq!(worker_count_for(16, 5), 4);
        assert_eq!(worker_count_for(33, 8), 7);
        // A target beyond the batch size collapses to one worker per item.
        assert_eq!(worker_count_for(4, 9), 4);
    }

    #[test]
    fn test_worker_count_spreads_evenly() {
        // Even split across cores.
        assert_eq!(worker_count_for(8, 4), 4);
        // More cores than items: one worker per item.
        assert_eq!(worker_count_for(5, 8), 5);
        // ceil(10/3)=4 items per worker needs only 3 workers.
        assert_eq!(worker_count_for(10, 3), 3);
        // Never exceeds the batch size.
        assert_eq!(worker_count_for(1, 64), 1);
        assert_eq!(worker_count_for(3, 2), 2);
    }
}
