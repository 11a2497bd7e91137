//! Single-worker stage that drives a [`Reader`] into the read pool.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::pipeline::status::PipelineStatus;
use crate::pool::BufferPool;
use crate::reader::Reader;

/// One thread looping acquire-write → `Reader::read` → commit.
///
/// Terminates when the read pool is closed or the reader fails; a reader
/// failure is recorded as fatal and closes the pool so downstream stages
/// drain what was already queued and then stop.
pub(crate) struct ReadStage {
    handle: Option<JoinHandle<()>>,
}

impl ReadStage {
    pub(crate) fn spawn<R: Reader + 'static>(
        pool: Arc<BufferPool>,
        reader: Arc<Mutex<R>>,
        status: Arc<PipelineStatus>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("loadr-read".to_string())
            .spawn(move || run(pool, reader, status))
            .map_err(|e| Error::Allocation {
                reason: format!("failed to spawn read thread: {e}"),
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the stage thread to terminate. The pool must be closed first.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<R: Reader>(pool: Arc<BufferPool>, reader: Arc<Mutex<R>>, status: Arc<PipelineStatus>) {
    while let Some(mut pair) = pool.acquire_write() {
        let result = reader.lock().unwrap().read(&mut pair);
        match result {
            Ok(()) => pool.commit_write(pair),
            Err(e) => {
                error!(error = %e, "reader failed, stopping read stage");
                pool.abort_write(pair);
                status.fail(e);
                pool.close();
                break;
            }
        }
    }
    debug!("read stage terminated");
}
