//! Per-array backing file with a buddy free list
//!
//! A data store file is tiled from offset 0 to its logical end by
//! power-of-two chunks, each prefixed with a [`DiskChunkHeader`]. A chunk of
//! size `S` always starts at a multiple of `S`, so the buddy of a chunk is
//! simply `offset ^ S`.
//!
//! ```text
//! 0        128      256               512
//! +--------+--------+-----------------+
//! | used   | free   | used            |   <- headers say which is which
//! | 128    | 128    | 256             |
//! +--------+--------+-----------------+
//!                                     ^ allocated_size
//! ```
//!
//! The free list lives in memory and is persisted to a side file on flush.
//! Before the first mutation after a flush the side file is truncated, so a
//! crash before the next flush always forces a rebuild from the headers.

use crate::error::{DataStoreError, Result};
use crate::fault::{InjectedErrorListener, INVALIDATE_FREELIST_FAULT};
use crate::flusher::FlushQueue;
use crate::freelist::{
    read_freelist_file, remove_freelist_file, staging_path, truncate_freelist_file,
    write_freelist_file, Freelists,
};
use crate::header::{DiskChunkHeader, CHUNK_HEADER_SIZE, MIN_CHUNK_SIZE};
use crate::io::DataFile;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifier of one data store and its backing files
pub type Guid = u64;

/// State shared by every store opened through the same registry
///
/// Holds no reference to any store, so stores never keep their registry alive.
#[derive(Debug)]
pub struct DataStoreContext {
    min_alloc_size: u64,
    flush_queue: Arc<FlushQueue>,
    listener: Arc<InjectedErrorListener>,
}

impl DataStoreContext {
    pub fn new(
        min_alloc_size: u64,
        flush_queue: Arc<FlushQueue>,
        listener: Arc<InjectedErrorListener>,
    ) -> Self {
        DataStoreContext {
            min_alloc_size,
            flush_queue,
            listener,
        }
    }

    /// Context for a store used outside a registry: no background flushing
    pub fn standalone(min_alloc_size: u64) -> Arc<Self> {
        Arc::new(Self::new(
            min_alloc_size,
            Arc::new(FlushQueue::default()),
            Arc::new(InjectedErrorListener::new()),
        ))
    }

    pub fn min_alloc_size(&self) -> u64 {
        self.min_alloc_size
    }
}

/// A chunk handed out by [`DataStore::allocate_space`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the chunk (its header) in the data file
    pub offset: u64,
    /// Full chunk size, header included
    pub allocated_size: u64,
}

/// Capacity report for one store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataStoreSizes {
    /// Physical file size in bytes
    pub file_size: u64,
    /// 512-byte blocks the file occupies on disk
    pub file_blocks: u64,
    /// Logical end of the chunk tiling
    pub reserved_bytes: u64,
    /// Bytes sitting on the free list
    pub free_bytes: u64,
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataStoreStats {
    pub allocations: u64,
    pub frees: u64,
    /// Data file syncs issued by flush
    pub syncs: u64,
    /// Side files written
    pub freelist_persists: u64,
    /// Free lists rebuilt by scanning chunk headers
    pub rebuilds: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    freelists: Freelists,
    /// Logical end of file
    allocated_size: u64,
    largest_free_chunk: u64,
    /// Unsynced data writes
    dirty: bool,
    /// In-memory free list differs from the side file
    fl_dirty: bool,
    /// Side file deleted for good; never write it again
    freelist_removed: bool,
    stats: DataStoreStats,
}

/// Path of the side file that persists the free list of `data_path`
pub fn freelist_path_for(data_path: &Path) -> PathBuf {
    let mut path = OsString::from(data_path.as_os_str());
    path.push(".fl");
    PathBuf::from(path)
}

/// Round up to the next power of two, `None` on overflow
pub fn round_up_power_of_2(size: u64) -> Option<u64> {
    size.checked_next_power_of_two()
}

/// On-disk storage for one array
///
/// Space is reserved with [`allocate_space`](Self::allocate_space), filled
/// with [`write_data`](Self::write_data) and read back with
/// [`read_data`](Self::read_data). Nothing is durable until
/// [`flush`](Self::flush) returns.
pub struct DataStore {
    guid: Guid,
    file: DataFile,
    freelist_path: PathBuf,
    context: Arc<DataStoreContext>,
    state: Mutex<StoreState>,
}

impl DataStore {
    /// Open (or create) the data file at `path` and load its free list
    ///
    /// A missing, empty or damaged side file is not an error: the free list
    /// is rebuilt from the chunk headers instead.
    pub fn open<P: AsRef<Path>>(path: P, guid: Guid, context: Arc<DataStoreContext>) -> Result<Self> {
        let file = DataFile::open(path.as_ref())?;
        let freelist_path = freelist_path_for(path.as_ref());

        let store = DataStore {
            guid,
            file,
            freelist_path,
            context,
            state: Mutex::new(StoreState::default()),
        };

        store.initialize_freelist()?;
        tracing::trace!("Opened data store {} at {:?}", guid, store.file.path());

        Ok(store)
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn freelist_path(&self) -> &Path {
        &self.freelist_path
    }

    /// Bytes of every chunk taken by its header
    pub fn overhead(&self) -> u64 {
        DiskChunkHeader::overhead() as u64
    }

    pub fn min_alloc_size(&self) -> u64 {
        self.context.min_alloc_size
    }

    pub fn allocated_size(&self) -> u64 {
        self.state.lock().allocated_size
    }

    pub fn largest_free_chunk(&self) -> u64 {
        self.state.lock().largest_free_chunk
    }

    pub fn stats(&self) -> DataStoreStats {
        self.state.lock().stats
    }

    /// Copy of the in-memory free list
    pub fn freelist_snapshot(&self) -> Freelists {
        self.state.lock().freelists.clone()
    }

    /// Find space for a chunk holding `requested` payload bytes
    ///
    /// The chunk size is `requested` plus the header, rounded up to a power
    /// of two and at least the minimum allocation size. A free chunk of that
    /// size is reused if there is one, a larger one is split otherwise, and
    /// only then does the file grow.
    pub fn allocate_space(&self, requested: u64) -> Result<Allocation> {
        let required = self.required_size(requested)?;
        let mut state = self.state.lock();

        tracing::trace!(
            "Allocating {} bytes ({} byte chunk) in {:?}",
            requested,
            required,
            self.file.path()
        );

        self.invalidate_freelist_file(&mut state)?;

        let offset = loop {
            if let Some(offset) = self.search_freelist(&mut state, required)? {
                break offset;
            }
            self.make_more_space(&mut state, required)?;
        };

        if let Err(e) = self.file.write_header(offset, &DiskChunkHeader::used(required)) {
            // Header on disk still reads free; hand the chunk back
            if self.add_to_freelist(&mut state, required, offset, true).is_err() {
                state.freelists.entry(required).or_default().insert(offset);
            }
            Self::calc_largest_free_chunk(&mut state);
            return Err(e);
        }

        Self::calc_largest_free_chunk(&mut state);
        state.stats.allocations += 1;
        self.mark_dirty(&mut state);

        tracing::trace!("Allocated chunk {} of {} bytes", offset, required);

        Ok(Allocation {
            offset,
            allocated_size: required,
        })
    }

    /// Write `data` into a chunk previously returned by `allocate_space`
    pub fn write_data(&self, offset: u64, data: &[u8], allocated_size: u64) -> Result<()> {
        self.check_chunk_shape(offset, allocated_size)?;
        if data.len() as u64 + self.overhead() > allocated_size {
            return Err(DataStoreError::InvalidChunk {
                offset,
                size: allocated_size,
                reason: "payload does not fit in chunk",
            });
        }

        let mut state = self.state.lock();
        Self::check_in_range(&state, offset, allocated_size)?;

        self.file
            .write_chunk(offset, &DiskChunkHeader::used(allocated_size), data)?;
        self.mark_dirty(&mut state);

        Ok(())
    }

    /// Read `buf.len()` payload bytes of the chunk at `offset`
    ///
    /// Does not take the store lock.
    pub fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let header = self.file.read_chunk(offset, buf)?;

        if !header.is_used() || buf.len() as u64 + self.overhead() > header.size {
            return Err(DataStoreError::ChunkCorrupted {
                path: self.file.path().to_path_buf(),
                offset,
            });
        }

        Ok(())
    }

    /// Return a chunk to the free list, marking it free on disk
    ///
    /// Only one header is written: that of the chunk itself, or of the
    /// parent it merged into.
    ///
    /// The chunk is merged with its buddy for as long as the buddy is free.
    /// Freeing a chunk that is already free, or with a size that does not
    /// match its header, is rejected.
    pub fn free_chunk(&self, offset: u64, allocated: u64) -> Result<()> {
        self.check_chunk_shape(offset, allocated)?;

        let mut state = self.state.lock();
        Self::check_in_range(&state, offset, allocated)?;

        tracing::trace!("Freeing chunk {} ({} bytes) in {:?}", offset, allocated, self.file.path());

        if Self::is_parent_block_free(&state, offset, allocated) {
            return Err(DataStoreError::DoubleFree {
                offset,
                size: allocated,
            });
        }

        let header = self.file.read_header(offset)?;
        if !header.is_used() || header.size != allocated {
            return Err(DataStoreError::ChunkNotAllocated {
                offset,
                expected: allocated,
                found_magic: header.magic,
                found_size: header.size,
            });
        }

        self.invalidate_freelist_file(&mut state)?;

        self.add_to_freelist(&mut state, allocated, offset, false)?;
        Self::calc_largest_free_chunk(&mut state);
        state.stats.frees += 1;

        Ok(())
    }

    /// Make data and free list durable
    ///
    /// Does nothing when neither has changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        tracing::trace!("Flushing data store {:?}", self.file.path());

        if state.dirty {
            self.file.sync_data()?;
            state.dirty = false;
            state.stats.syncs += 1;
        }

        if state.fl_dirty && !state.freelist_removed {
            self.persist_freelists(&mut state)?;
        }

        Ok(())
    }

    /// Physical and logical size of the store
    pub fn get_sizes(&self) -> Result<DataStoreSizes> {
        let state = self.state.lock();
        let (file_size, file_blocks) = self.file.size_and_blocks()?;

        let free_bytes = state
            .freelists
            .iter()
            .map(|(size, offsets)| size * offsets.len() as u64)
            .sum();

        Ok(DataStoreSizes {
            file_size,
            file_blocks,
            reserved_bytes: state.allocated_size,
            free_bytes,
        })
    }

    /// Check every free-list entry against the header on disk
    pub fn verify_freelist(&self) -> Result<()> {
        let state = self.state.lock();
        let result = self.verify_freelist_internal(&state);
        if result.is_err() {
            self.dump_freelist_locked(&state);
        }
        result
    }

    /// Log the free list at debug level
    pub fn dump_freelist(&self) {
        let state = self.state.lock();
        self.dump_freelist_locked(&state);
    }

    /// Take the data file out of the directory now, delete it on last drop
    ///
    /// A store opened afterwards under the same guid gets a new, empty file.
    pub fn remove_on_close(&self) -> Result<()> {
        self.file.remove_on_close()
    }

    /// Delete the side file
    ///
    /// A flush that races with removal will not bring it back.
    pub fn remove_freelist_file(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.freelist_removed = true;
        state.fl_dirty = false;
        remove_freelist_file(&staging_path(&self.freelist_path))?;
        remove_freelist_file(&self.freelist_path)
    }

    fn required_size(&self, requested: u64) -> Result<u64> {
        requested
            .checked_add(self.overhead())
            .and_then(round_up_power_of_2)
            .map(|size| size.max(self.context.min_alloc_size))
            .ok_or(DataStoreError::AllocationTooLarge(requested))
    }

    /// Size is a legal chunk size and the offset is aligned to it
    fn check_chunk_shape(&self, offset: u64, size: u64) -> Result<()> {
        let reason = if !size.is_power_of_two() {
            "size is not a power of two"
        } else if size < MIN_CHUNK_SIZE {
            "size below smallest chunk"
        } else if offset % size != 0 {
            "offset not aligned to size"
        } else {
            return Ok(());
        };
        Err(DataStoreError::InvalidChunk {
            offset,
            size,
            reason,
        })
    }

    fn check_in_range(state: &StoreState, offset: u64, size: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= state.allocated_size => Ok(()),
            _ => Err(DataStoreError::InvalidChunk {
                offset,
                size,
                reason: "chunk extends past end of store",
            }),
        }
    }

    fn mark_dirty(&self, state: &mut StoreState) {
        if !state.dirty {
            state.dirty = true;
            self.context.flush_queue.add(self.guid);
        }
    }

    /// Truncate the side file before the first free-list change after a flush
    fn invalidate_freelist_file(&self, state: &mut StoreState) -> Result<()> {
        if state.fl_dirty || state.freelist_removed {
            return Ok(());
        }

        tracing::trace!("Invalidating free list for {:?}", self.file.path());
        truncate_freelist_file(&self.freelist_path)?;
        self.context.listener.check(INVALIDATE_FREELIST_FAULT)?;

        state.fl_dirty = true;
        self.context.flush_queue.add(self.guid);
        Ok(())
    }

    fn persist_freelists(&self, state: &mut StoreState) -> Result<()> {
        // Free headers must be on disk before the side file vouches for them
        self.file.sync_data()?;
        let buckets = write_freelist_file(&self.freelist_path, &state.freelists)?;

        tracing::trace!(
            "Persisted {} free list buckets for {:?}",
            buckets,
            self.file.path()
        );

        state.fl_dirty = false;
        state.stats.freelist_persists += 1;
        Ok(())
    }

    fn initialize_freelist(&self) -> Result<()> {
        let mut state = self.state.lock();
        let file_len = self.file.len()?;

        match read_freelist_file(&self.freelist_path) {
            Ok(Some(load)) if load.is_complete() => {
                match self.check_loaded_freelist(&load.freelists, file_len) {
                    Ok(()) => {
                        state.freelists = load.freelists;
                        state.allocated_size = file_len;
                        Self::calc_largest_free_chunk(&mut state);
                        tracing::debug!(
                            "Loaded {} free list buckets for {:?}",
                            load.buckets_read,
                            self.file.path()
                        );
                        return Ok(());
                    }
                    Err(reason) => tracing::warn!(
                        "Discarding free list for {:?}: {}",
                        self.file.path(),
                        reason
                    ),
                }
            }
            Ok(Some(load)) if load.buckets_corrupt > 0 => tracing::warn!(
                "Discarding free list for {:?}: {} of {} buckets corrupt",
                self.file.path(),
                load.buckets_corrupt,
                load.buckets_corrupt + load.buckets_read
            ),
            Ok(Some(_)) => {
                tracing::debug!("Empty free list file for {:?}", self.file.path())
            }
            Ok(None) => tracing::debug!("No free list file for {:?}", self.file.path()),
            Err(e) => tracing::warn!(
                "Failed to read free list for {:?}: {}",
                self.file.path(),
                e
            ),
        }

        self.rebuild_freelist(&mut state, file_len)
    }

    /// Reject a loaded free list that cannot describe this data file
    fn check_loaded_freelist(
        &self,
        freelists: &Freelists,
        file_len: u64,
    ) -> std::result::Result<(), String> {
        let min = MIN_CHUNK_SIZE;
        if file_len % min != 0 {
            return Err(format!(
                "file length {} is not a multiple of {}",
                file_len, min
            ));
        }

        let mut chunks = Vec::new();
        for (&size, offsets) in freelists {
            if !size.is_power_of_two() || size < min {
                return Err(format!("bad bucket size {}", size));
            }
            for &offset in offsets {
                let in_file = offset.checked_add(size).map_or(false, |end| end <= file_len);
                if offset % size != 0 || !in_file {
                    return Err(format!("bad offset {} in bucket {}", offset, size));
                }
                chunks.push((offset, size));
            }
        }

        chunks.sort_unstable();
        for pair in chunks.windows(2) {
            let (offset, size) = pair[0];
            if offset + size > pair[1].0 {
                return Err(format!("chunks at {} and {} overlap", offset, pair[1].0));
            }
        }

        Ok(())
    }

    /// Rebuild the free list by walking chunk headers from offset 0
    ///
    /// Only a torn tail is cut off: a last chunk running past the end of the
    /// file, or a zero-filled remainder left by an interrupted grow. Any other
    /// unusable header is reported as corruption and the file is left alone.
    fn rebuild_freelist(&self, state: &mut StoreState, file_len: u64) -> Result<()> {
        let overhead = CHUNK_HEADER_SIZE as u64;
        let mut free_chunks = Vec::new();
        let mut smallest = u64::MAX;
        let mut offset = 0u64;

        state.freelists.clear();

        while offset < file_len {
            let header = if offset + overhead <= file_len {
                Some(self.file.read_header(offset)?)
            } else {
                None
            };

            if let Some(header) = header.filter(|h| self.is_chunk_start(offset, h)) {
                let size = header.size;
                if offset.checked_add(size).map_or(false, |end| end <= file_len) {
                    if header.is_free() {
                        free_chunks.push((offset, size));
                    }
                    smallest = smallest.min(size);
                    offset += size;
                    continue;
                }

                tracing::warn!(
                    "Chunk at {} in {:?} ({} bytes) runs past end of file at {}",
                    offset,
                    self.file.path(),
                    size,
                    file_len
                );
                break;
            }

            if self.file.is_zeroed(offset, file_len)? {
                break;
            }

            tracing::error!(
                "Unusable chunk header in {:?} at offset {} of {}; refusing to rebuild",
                self.file.path(),
                offset,
                file_len
            );
            return Err(DataStoreError::ChunkCorrupted {
                path: self.file.path().to_path_buf(),
                offset,
            });
        }

        if smallest < self.context.min_alloc_size {
            tracing::warn!(
                "{:?} holds {} byte chunks, below the configured minimum of {}",
                self.file.path(),
                smallest,
                self.context.min_alloc_size
            );
        }

        state.allocated_size = offset;
        if file_len != offset {
            tracing::warn!(
                "Truncating torn tail of {:?} from {} to {} bytes",
                self.file.path(),
                file_len,
                offset
            );
            self.file.set_len(offset)?;
        }

        let free_count = free_chunks.len();
        for (offset, size) in free_chunks {
            self.add_to_freelist(state, size, offset, true)?;
        }
        Self::calc_largest_free_chunk(state);

        // Whatever is in the side file is stale now
        truncate_freelist_file(&self.freelist_path)?;
        state.fl_dirty = true;
        state.stats.rebuilds += 1;
        self.context.flush_queue.add(self.guid);

        tracing::info!(
            "Rebuilt free list for {:?} from chunk headers: {} bytes, {} free chunks",
            self.file.path(),
            offset,
            free_count
        );
        Ok(())
    }

    /// Header is valid and describes a chunk that may start at `offset`
    fn is_chunk_start(&self, offset: u64, header: &DiskChunkHeader) -> bool {
        header.is_valid()
            && header.size.is_power_of_two()
            && header.size >= MIN_CHUNK_SIZE
            && offset % header.size == 0
    }

    /// Take a free chunk of exactly `size` bytes, splitting a larger one if needed
    fn search_freelist(&self, state: &mut StoreState, size: u64) -> Result<Option<u64>> {
        if let Some(offset) = Self::take_free(&mut state.freelists, size) {
            return Ok(Some(offset));
        }

        let larger = state
            .freelists
            .range(size + 1..)
            .find_map(|(&key, bucket)| bucket.first().map(|&offset| (key, offset)));
        let Some((chunk_size, offset)) = larger else {
            return Ok(None);
        };

        // Keep the lower half each time, free the upper half
        let mut uppers = Vec::new();
        let mut half = chunk_size;
        while half > size {
            half /= 2;
            let upper = offset + half;
            self.file.write_header(upper, &DiskChunkHeader::free(half))?;
            uppers.push((half, upper));
        }

        Self::take_free(&mut state.freelists, chunk_size);
        for (half, upper) in uppers {
            state.freelists.entry(half).or_default().insert(upper);
        }

        tracing::trace!("Split chunk {} ({} bytes) down to {} bytes", offset, chunk_size, size);
        Ok(Some(offset))
    }

    fn take_free(freelists: &mut Freelists, size: u64) -> Option<u64> {
        let bucket = freelists.get_mut(&size)?;
        let offset = bucket.pop_first();
        if bucket.is_empty() {
            freelists.remove(&size);
        }
        offset
    }

    /// Append free chunks at the end of the file until one of `size` exists
    ///
    /// The end is first padded with free chunks until it is aligned to
    /// `size`; each pad is as large as the current end's alignment allows.
    fn make_more_space(&self, state: &mut StoreState, size: u64) -> Result<()> {
        let start = state.allocated_size;

        while state.allocated_size % size != 0 {
            let offset = state.allocated_size;
            let pad = offset & offset.wrapping_neg();
            self.append_free_chunk(state, offset, pad)?;
        }

        if state.freelists.range(size..).next().is_none() {
            let offset = state.allocated_size;
            self.append_free_chunk(state, offset, size)?;
        }

        tracing::debug!(
            "Grew {:?} from {} to {} bytes for a {} byte chunk",
            self.file.path(),
            start,
            state.allocated_size,
            size
        );
        Ok(())
    }

    fn append_free_chunk(&self, state: &mut StoreState, offset: u64, size: u64) -> Result<()> {
        let end = offset
            .checked_add(size)
            .ok_or(DataStoreError::AllocationTooLarge(size))?;

        self.file.set_len(end)?;
        state.allocated_size = end;

        if let Err(e) = self.add_to_freelist(state, size, offset, false) {
            state.allocated_size = offset;
            if let Err(undo) = self.file.set_len(offset) {
                tracing::warn!(
                    "Could not shrink {:?} back to {} bytes: {}",
                    self.file.path(),
                    offset,
                    undo
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Insert a free chunk, merging buddies
    ///
    /// Only the header of the final merged chunk is written; the headers it
    /// swallows become payload. When nothing merges and `header_written` is
    /// set, nothing is written at all. Memory changes only after the write.
    fn add_to_freelist(
        &self,
        state: &mut StoreState,
        size: u64,
        offset: u64,
        header_written: bool,
    ) -> Result<()> {
        let mut merged_size = size;
        let mut merged_offset = offset;
        let mut buddies = Vec::new();

        loop {
            let Some(parent_size) = merged_size.checked_mul(2) else {
                break;
            };
            let buddy = merged_offset ^ merged_size;
            let parent_offset = merged_offset.min(buddy);
            let fits = parent_offset
                .checked_add(parent_size)
                .map_or(false, |end| end <= state.allocated_size);
            let buddy_free = state
                .freelists
                .get(&merged_size)
                .map_or(false, |bucket| bucket.contains(&buddy));

            if !fits || !buddy_free {
                break;
            }

            buddies.push((merged_size, buddy));
            merged_size = parent_size;
            merged_offset = parent_offset;
        }

        if !buddies.is_empty() || !header_written {
            self.file
                .write_header(merged_offset, &DiskChunkHeader::free(merged_size))?;
        }

        if !buddies.is_empty() {
            for (size, buddy) in buddies {
                if let Some(bucket) = state.freelists.get_mut(&size) {
                    bucket.remove(&buddy);
                    if bucket.is_empty() {
                        state.freelists.remove(&size);
                    }
                }
            }
            tracing::trace!(
                "Merged chunk {} ({} bytes) into {} ({} bytes)",
                offset,
                size,
                merged_offset,
                merged_size
            );
        }

        state
            .freelists
            .entry(merged_size)
            .or_default()
            .insert(merged_offset);
        Ok(())
    }

    /// The chunk, or any chunk containing it, is already on the free list
    fn is_parent_block_free(state: &StoreState, offset: u64, size: u64) -> bool {
        let mut block_size = size;
        while block_size <= state.allocated_size {
            let block_offset = offset & !(block_size - 1);
            if state
                .freelists
                .get(&block_size)
                .map_or(false, |bucket| bucket.contains(&block_offset))
            {
                return true;
            }
            block_size = match block_size.checked_mul(2) {
                Some(next) => next,
                None => break,
            };
        }
        false
    }

    fn calc_largest_free_chunk(state: &mut StoreState) {
        state.largest_free_chunk = state
            .freelists
            .iter()
            .next_back()
            .map_or(0, |(&size, _)| size);
    }

    fn verify_freelist_internal(&self, state: &StoreState) -> Result<()> {
        for (&size, offsets) in &state.freelists {
            for &offset in offsets {
                let corrupted = |reason: String| DataStoreError::FreelistCorrupted {
                    path: self.file.path().to_path_buf(),
                    offset,
                    reason,
                };

                let in_range = offset.checked_add(size).map_or(false, |end| end <= state.allocated_size);
                if !in_range {
                    return Err(corrupted(format!(
                        "free chunk of {} bytes extends past end {}",
                        size, state.allocated_size
                    )));
                }

                let header = self.file.read_header(offset)?;
                if !header.is_free() {
                    return Err(corrupted(format!(
                        "expected free header, found magic {:#x}",
                        header.magic
                    )));
                }
                if header.size != size {
                    return Err(corrupted(format!(
                        "header size {} does not match bucket {}",
                        header.size, size
                    )));
                }
            }
        }
        Ok(())
    }

    fn dump_freelist_locked(&self, state: &StoreState) {
        tracing::debug!("Free lists for data store {:?}:", self.file.path());
        for (size, offsets) in &state.freelists {
            tracing::debug!("   bucket [ {} ] : {:?}", size, offsets);
        }
    }
}
