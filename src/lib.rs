//! A page-buffered storage core implementing Single-Writer/Multiple-Reader
//! concurrency through a side-channel metadata file: a writer publishes
//! pages, an index, and a header each tick; readers poll the metadata
//! file with bounded retries and a checksum protocol instead of locking.

pub mod cache_shim;
pub mod container;
pub mod error;
pub mod metafile;
pub mod orchestrator;
pub mod pagebuffer;
pub mod retry;
pub mod stats;
pub mod tick;

pub use cache_shim::{CacheShim, EntityKind, ObjectLocation};
pub use error::{CoreError, Result};
pub use orchestrator::{AccessMode, CoreHandle, OpenOptions};
pub use pagebuffer::{PageBuffer, PageBufferConfig};
pub use stats::PageBufferStats;
pub use tick::TickCoordinator;
