//! # loadr
//!
//! **High-throughput mini-batch data loader — keeps a device fed with
//! decoded batches while training runs.**
//!
//! loadr streams fixed-size (datum, target) batches out of a large on-disk
//! corpus through a three-stage threaded pipeline and into device-resident
//! double buffers, so the training loop never waits on decode.
//!
//! ## Pipeline
//!
//! ```text
//! ┌────────┐  pool(2)  ┌───────────────────┐  pool(2)  ┌─────────────┐
//! │ Reader │──────────►│ DecodePool        │──────────►│ Device      │
//! │ 1 thread│          │ N workers + 1 mgr │           │ slots {0,1} │
//! └────────┘           └───────────────────┘           └─────────────┘
//!                                                        ▲ Loader::next
//! ```
//!
//! Each stage handoff is a bounded two-slot [`pool::BufferPool`]; decode
//! workers write disjoint regions of one shared output batch, so the batch
//! needs no locks; the manager transposes the assembled batch to
//! feature-major layout and uploads it to alternating device slots.
//!
//! ## Design
//!
//! - **Traits at the seams**: [`reader::Reader`], [`media::Media`], and
//!   [`device::Device`] are the collaborator interfaces; the pipeline core
//!   never sees file formats, codecs, or transfer engines.
//! - **Backpressure, not buffering**: two slots per pool bound the whole
//!   pipeline at four in-flight batches.
//! - **Fail loud**: fatal stage errors close the pools and surface from
//!   [`Loader::next`](loader::Loader::next) instead of stalling the loop.

pub mod buffer;
pub mod corpus;
pub mod device;
pub mod error;
pub mod loader;
pub mod media;
pub mod pool;
pub mod reader;
pub mod transpose;

mod pipeline;

// Re-export the primary loadr types
pub use buffer::{Buffer, BufferPair};
pub use corpus::{write_corpus, CorpusConfig, CorpusReader};
pub use device::{Device, DeviceKind, HostDevice, DEVICE_SLOTS};
pub use error::{Error, Result};
pub use loader::{Loader, LoaderConfig};
pub use media::{Media, RawMedia};
pub use pool::BufferPool;
pub use reader::Reader;
