//! Free-list index and its side-file serialization
//!
//! In memory the free list maps a bucket (a power-of-two chunk size) to the
//! ordered set of free chunk offsets of that size.
//!
//! On disk the side file is a plain concatenation of bucket blobs, one per
//! non-empty bucket:
//!
//! ```text
//! +-----------------+----------+----------------+---------------------+-----------+
//! | total_size  u64 | key  u64 | nelements  u64 | offsets  u64 x n    | crc32 u32 |
//! +-----------------+----------+----------------+---------------------+-----------+
//!                   |<------------------ total_size bytes ----------------------->|
//!                   |<------------- covered by crc32 ---------------->|
//! ```
//!
//! All integers are little-endian. `total_size` lets a reader step over a
//! bucket whose checksum does not match and keep going, so a loader can report
//! how many buckets were good and how many were not.

use crate::error::{DataStoreError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// bucket size -> free offsets
pub type Freelists = BTreeMap<u64, BTreeSet<u64>>;

const U64_LEN: usize = 8;
const CRC_LEN: usize = 4;

/// Smallest legal `total_size`: key + nelements + crc
const MIN_BUCKET_BODY: usize = 2 * U64_LEN + CRC_LEN;

/// One serialized free-list bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreelistBucket {
    /// Full serialized form, `total_size` prefix included
    buf: Vec<u8>,
}

impl FreelistBucket {
    /// Serialize one bucket of the free list
    pub fn new(key: u64, offsets: &BTreeSet<u64>) -> Self {
        let total_size = MIN_BUCKET_BODY + offsets.len() * U64_LEN;
        let mut buf = Vec::with_capacity(U64_LEN + total_size);

        buf.extend_from_slice(&(total_size as u64).to_le_bytes());
        buf.extend_from_slice(&key.to_le_bytes());
        buf.extend_from_slice(&(offsets.len() as u64).to_le_bytes());
        for offset in offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }

        let crc = crc32fast::hash(&buf[U64_LEN..]);
        buf.extend_from_slice(&crc.to_le_bytes());

        FreelistBucket { buf }
    }

    /// Decode the bucket at the start of `bytes`
    ///
    /// `position` is where `bytes` starts in the side file and is only used
    /// for error reporting.
    pub fn decode(bytes: &[u8], position: u64) -> Result<Self> {
        let frame = frame_len(bytes).ok_or(DataStoreError::BucketTruncated { offset: position })?;
        let buf = &bytes[..frame];

        let body_end = frame - CRC_LEN;
        let stored_crc = u32::from_le_bytes([
            buf[body_end],
            buf[body_end + 1],
            buf[body_end + 2],
            buf[body_end + 3],
        ]);
        if stored_crc != crc32fast::hash(&buf[U64_LEN..body_end]) {
            return Err(DataStoreError::BucketChecksumMismatch { offset: position });
        }

        let bucket = FreelistBucket { buf: buf.to_vec() };
        let expected = bucket
            .nelements()
            .checked_mul(U64_LEN as u64)
            .and_then(|n| n.checked_add(MIN_BUCKET_BODY as u64));
        if expected != Some(bucket.total_size()) {
            return Err(DataStoreError::BucketChecksumMismatch { offset: position });
        }

        Ok(bucket)
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut word = [0u8; U64_LEN];
        word.copy_from_slice(&self.buf[at..at + U64_LEN]);
        u64::from_le_bytes(word)
    }

    fn total_size(&self) -> u64 {
        self.read_u64(0)
    }

    /// Chunk size of every offset in this bucket
    pub fn key(&self) -> u64 {
        self.read_u64(U64_LEN)
    }

    pub fn nelements(&self) -> u64 {
        self.read_u64(2 * U64_LEN)
    }

    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.nelements() as usize).map(move |i| self.read_u64(3 * U64_LEN + i * U64_LEN))
    }

    /// Unserialize this bucket into `freelists`
    pub fn unload(&self, freelists: &mut Freelists) {
        tracing::trace!(
            "Unloading bucket with key {} and {} elements",
            self.key(),
            self.nelements()
        );
        freelists.entry(self.key()).or_default().extend(self.offsets());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Serialized length including the `total_size` prefix
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

/// Length of the bucket frame at the start of `bytes`, if it is complete
fn frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < U64_LEN {
        return None;
    }
    let mut word = [0u8; U64_LEN];
    word.copy_from_slice(&bytes[..U64_LEN]);
    let total_size = usize::try_from(u64::from_le_bytes(word)).ok()?;

    if total_size < MIN_BUCKET_BODY {
        return None;
    }
    let frame = total_size.checked_add(U64_LEN)?;
    if frame > bytes.len() {
        return None;
    }
    Some(frame)
}

/// Result of reading a side file
#[derive(Debug, Default)]
pub struct FreelistLoad {
    pub freelists: Freelists,
    /// Buckets that decoded and passed their checksum
    pub buckets_read: usize,
    /// Buckets that failed their checksum or were cut short
    pub buckets_corrupt: usize,
}

impl FreelistLoad {
    /// Every bucket in the file was good, and there was at least one
    pub fn is_complete(&self) -> bool {
        self.buckets_corrupt == 0 && self.buckets_read > 0
    }
}

/// Read a side file
///
/// Returns `Ok(None)` when the file does not exist. Corrupt buckets are
/// counted and skipped when their frame length is usable; a frame that
/// cannot be delimited ends the scan.
pub fn read_freelist_file(path: &Path) -> Result<Option<FreelistLoad>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut load = FreelistLoad::default();
    let mut position = 0usize;

    while position < data.len() {
        let rest = &data[position..];
        match FreelistBucket::decode(rest, position as u64) {
            Ok(bucket) => {
                bucket.unload(&mut load.freelists);
                load.buckets_read += 1;
                position += bucket.size();
            }
            Err(e) => {
                tracing::warn!("Bad free list bucket in {:?}: {}", path, e);
                load.buckets_corrupt += 1;
                match frame_len(rest) {
                    Some(frame) => position += frame,
                    None => break,
                }
            }
        }
    }

    Ok(Some(load))
}

/// Temporary path a side file is staged at before being renamed into place
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".tmp");
    PathBuf::from(staged)
}

/// Persist every non-empty bucket to the side file
///
/// The buckets are written to a staging file, synced, then renamed over
/// `path`, so a reader only ever sees a complete side file or the previous
/// one. Returns the number of buckets written.
pub fn write_freelist_file(path: &Path, freelists: &Freelists) -> Result<usize> {
    let mut buf = Vec::new();
    let mut buckets = 0;

    for (&key, offsets) in freelists {
        if offsets.is_empty() {
            continue;
        }
        let bucket = FreelistBucket::new(key, offsets);
        buf.extend_from_slice(bucket.as_bytes());
        buckets += 1;
    }

    let staged = staging_path(path);
    let mut file = File::create(&staged)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&staged, path)?;
    Ok(buckets)
}

/// Truncate the side file to zero length so it can no longer be trusted
pub fn truncate_freelist_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.sync_all()?;
    Ok(())
}

/// Remove the side file, ignoring a missing file
pub fn remove_freelist_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Freelists {
        let mut freelists = Freelists::new();
        freelists.insert(512, [0u64, 1024, 4096].into_iter().collect());
        freelists.insert(2048, [8192u64].into_iter().collect());
        freelists.insert(65536, [65536u64, 196608].into_iter().collect());
        freelists
    }

    #[test]
    fn test_bucket_layout() {
        let offsets: BTreeSet<u64> = [64u64, 192].into_iter().collect();
        let bucket = FreelistBucket::new(64, &offsets);

        // total_size + key + nelements + 2 offsets + crc
        assert_eq!(bucket.size(), 8 + 8 + 8 + 16 + 4);
        assert_eq!(&bucket.as_bytes()[0..8], &36u64.to_le_bytes());
        assert_eq!(bucket.key(), 64);
        assert_eq!(bucket.nelements(), 2);
        assert_eq!(bucket.offsets().collect::<Vec<_>>(), vec![64, 192]);
    }

    #[test]
    fn test_decode_detects_bit_flip() {
        let offsets: BTreeSet<u64> = [4096u64].into_iter().collect();
        let bucket = FreelistBucket::new(4096, &offsets);

        let mut bytes = bucket.as_bytes().to_vec();
        bytes[20] ^= 0x01;

        assert!(matches!(
            FreelistBucket::decode(&bytes, 0),
            Err(DataStoreError::BucketChecksumMismatch { offset: 0 })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let offsets: BTreeSet<u64> = [4096u64, 8192].into_iter().collect();
        let bucket = FreelistBucket::new(4096, &offsets);
        let bytes = &bucket.as_bytes()[..bucket.size() - 3];

        assert!(matches!(
            FreelistBucket::decode(bytes, 7),
            Err(DataStoreError::BucketTruncated { offset: 7 })
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("9.data.fl");
        let freelists = sample();

        assert_eq!(write_freelist_file(&path, &freelists).unwrap(), 3);
        assert!(!staging_path(&path).exists());

        let load = read_freelist_file(&path).unwrap().unwrap();
        assert!(load.is_complete());
        assert_eq!(load.buckets_read, 3);
        assert_eq!(load.freelists, freelists);
    }

    #[test]
    fn test_corrupt_bucket_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("10.data.fl");
        write_freelist_file(&path, &sample()).unwrap();

        // Flip a byte inside the first bucket's offsets
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[30] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let load = read_freelist_file(&path).unwrap().unwrap();
        assert_eq!(load.buckets_read, 2);
        assert_eq!(load.buckets_corrupt, 1);
        assert!(!load.is_complete());
        assert!(!load.freelists.contains_key(&512));
        assert!(load.freelists.contains_key(&2048));
        assert!(load.freelists.contains_key(&65536));
    }

    #[test]
    fn test_missing_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("11.data.fl");
        assert!(read_freelist_file(&path).unwrap().is_none());

        truncate_freelist_file(&path).unwrap();
        let load = read_freelist_file(&path).unwrap().unwrap();
        assert_eq!(load.buckets_read, 0);
        assert!(!load.is_complete());

        remove_freelist_file(&path).unwrap();
        remove_freelist_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_buckets_not_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("12.data.fl");
        let mut freelists = sample();
        freelists.insert(128, BTreeSet::new());

        assert_eq!(write_freelist_file(&path, &freelists).unwrap(), 3);
    }
}
