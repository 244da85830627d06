//! # datastore-rs - Per-Array Backing Files
//!
//! `datastore-rs` manages the on-disk space of an array storage engine. Every
//! array gets one backing file, carved into power-of-two chunks by a buddy
//! allocator whose free list is kept in memory and persisted beside the file.
//!
//! - **Buddy allocation** with split on allocate and merge on free
//! - **Crash tolerant free list**: CRC32-checked side file, rebuilt from chunk
//!   headers whenever it cannot be trusted
//! - **Background flushing** of dirty stores on a fixed interval
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datastore_rs::{DataStores, DataStoresConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let stores = DataStores::new();
//! stores.init_data_stores(DataStoresConfig::new("/var/lib/arrays/datastores"))?;
//!
//! let store = stores.get_data_store(42)?;
//! let chunk = store.allocate_space(5)?;
//! store.write_data(chunk.offset, b"cells", chunk.allocated_size)?;
//! store.flush()?;
//!
//! let mut buf = [0u8; 5];
//! store.read_data(chunk.offset, &mut buf)?;
//!
//! store.free_chunk(chunk.offset, chunk.allocated_size)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## File Layout
//!
//! Store `42` under base path `B` lives in `B/42.data`, with its free list in
//! `B/42.data.fl`. Both are plain files; see [`header`] and [`freelist`] for
//! their formats.

pub mod config;
pub mod datastore;
pub mod error;
pub mod fault;
pub mod flusher;
pub mod freelist;
pub mod header;
pub mod io;
pub mod registry;

pub use config::{DataStoresConfig, DEFAULT_MIN_ALLOC_SIZE};
pub use datastore::{
    Allocation, DataStore, DataStoreContext, DataStoreSizes, DataStoreStats, Guid,
};
pub use error::{DataStoreError, Result};
pub use fault::InjectedErrorListener;
pub use flusher::{DataStoreFlusher, FlushQueue};
pub use freelist::Freelists;
pub use header::{DiskChunkHeader, CHUNK_HEADER_SIZE, FREE_MAGIC, USED_MAGIC};
pub use registry::{DataStoreInfo, DataStores, ListDataStoresBuilder};
