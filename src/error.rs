use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk header corrupted in {path} at offset {offset}")]
    ChunkCorrupted { path: PathBuf, offset: u64 },

    #[error("Free list corrupted in {path} at offset {offset}: {reason}")]
    FreelistCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("Free list bucket checksum verification failed at side-file offset {offset}")]
    BucketChecksumMismatch { offset: u64 },

    #[error("Free list bucket truncated at side-file offset {offset}")]
    BucketTruncated { offset: u64 },

    #[error("Double free of chunk at offset {offset} (size {size})")]
    DoubleFree { offset: u64, size: u64 },

    #[error(
        "Chunk at offset {offset} is not allocated with size {expected} \
         (header magic {found_magic:#x}, size {found_size})"
    )]
    ChunkNotAllocated {
        offset: u64,
        expected: u64,
        found_magic: u64,
        found_size: u64,
    },

    #[error("Invalid chunk at offset {offset} (size {size}): {reason}")]
    InvalidChunk {
        offset: u64,
        size: u64,
        reason: &'static str,
    },

    #[error("Allocation request too large: {0} bytes")]
    AllocationTooLarge(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Data stores used before init_data_stores()")]
    NotInitialized,

    #[error("Data store flusher is already running")]
    FlusherAlreadyRunning,

    #[error("Injected fault: {0}")]
    InjectedFault(&'static str),
}

pub type Result<T> = std::result::Result<T, DataStoreError>;
