//! On-disk chunk header
//!
//! Every chunk in a data file starts with a 16-byte header:
//!
//! ```text
//! +----------------+----------------+
//! | magic (u64 LE) | size (u64 LE)  |
//! +----------------+----------------+
//! ```
//!
//! `size` is the full chunk size including the header, always a power of two.
//! The magic tells a used chunk from a free one, which is what lets a data file
//! be rescanned from offset 0 when the persisted free list cannot be trusted.

use std::mem::size_of;

/// Magic value for a chunk that holds live data
pub const USED_MAGIC: u64 = 0xfeed_face_feed_face;

/// Magic value for a chunk that is on the free list
pub const FREE_MAGIC: u64 = 0xdead_beef_dead_beef;

/// Serialized size of [`DiskChunkHeader`]
pub const CHUNK_HEADER_SIZE: usize = 2 * size_of::<u64>();

/// Smallest chunk that can hold a header and at least one payload byte
pub const MIN_CHUNK_SIZE: u64 = 2 * CHUNK_HEADER_SIZE as u64;

/// Header that prefixes every chunk on disk
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskChunkHeader {
    pub magic: u64,
    pub size: u64,
}

impl DiskChunkHeader {
    pub fn used(size: u64) -> Self {
        DiskChunkHeader {
            magic: USED_MAGIC,
            size,
        }
    }

    pub fn free(size: u64) -> Self {
        DiskChunkHeader {
            magic: FREE_MAGIC,
            size,
        }
    }

    /// Bytes of every chunk consumed by the header
    pub const fn overhead() -> usize {
        CHUNK_HEADER_SIZE
    }

    /// Magic is one of the two reserved values
    pub fn is_valid(&self) -> bool {
        self.magic == USED_MAGIC || self.magic == FREE_MAGIC
    }

    pub fn is_free(&self) -> bool {
        self.magic == FREE_MAGIC
    }

    pub fn is_used(&self) -> bool {
        self.magic == USED_MAGIC
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    ///
    /// Any 16 bytes decode; callers check [`is_valid`](Self::is_valid).
    pub fn from_bytes(bytes: &[u8; CHUNK_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 8];
        let mut size = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        size.copy_from_slice(&bytes[8..16]);

        DiskChunkHeader {
            magic: u64::from_le_bytes(magic),
            size: u64::from_le_bytes(size),
        }
    }
}

impl Default for DiskChunkHeader {
    fn default() -> Self {
        Self::free(0)
    }
}
