//! Disk I/O for data store backing files
//!
//! All access is positioned (`pread`/`pwrite` style) so concurrent readers
//! never contend on a shared file cursor.

use crate::error::Result;
use crate::header::{DiskChunkHeader, CHUNK_HEADER_SIZE};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer size used when scanning a region of the file
const SCAN_BUFFER_SIZE: usize = 64 * 1024;

static TOMBSTONE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique name a removed data file is parked under until its handle drops
fn tombstone_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(
        ".removed-{}-{}",
        std::process::id(),
        TOMBSTONE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(name)
}

/// Disk-backed data file
///
/// [`remove_on_close`](Self::remove_on_close) moves the file to a tombstone
/// name at once and unlinks it when the handle drops, so a new file can be
/// created at the original path while old holders are still reading.
pub struct DataFile {
    file: File,
    path: PathBuf,
    tombstone: Mutex<Option<PathBuf>>,
}

impl DataFile {
    /// Open a data file, creating it if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(DataFile {
            file,
            path: path.as_ref().to_path_buf(),
            tombstone: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(DataFile {
            file,
            path: path.as_ref().to_path_buf(),
            tombstone: Mutex::new(None),
        })
    }

    /// Read the chunk header at `offset`
    pub fn read_header(&self, offset: u64) -> Result<DiskChunkHeader> {
        let mut buffer = [0u8; CHUNK_HEADER_SIZE];
        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(DiskChunkHeader::from_bytes(&buffer))
    }

    /// Write a chunk header at `offset`
    pub fn write_header(&self, offset: u64, header: &DiskChunkHeader) -> Result<()> {
        self.file.write_all_at(&header.to_bytes(), offset)?;
        Ok(())
    }

    /// Write a header followed by its payload in a single positioned write
    pub fn write_chunk(&self, offset: u64, header: &DiskChunkHeader, payload: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
        buffer.extend_from_slice(&header.to_bytes());
        buffer.extend_from_slice(payload);

        self.file.write_all_at(&buffer, offset)?;
        Ok(())
    }

    /// Read a header and the payload that follows it into `payload`
    pub fn read_chunk(&self, offset: u64, payload: &mut [u8]) -> Result<DiskChunkHeader> {
        let mut buffer = vec![0u8; CHUNK_HEADER_SIZE + payload.len()];
        self.file.read_exact_at(&mut buffer, offset)?;

        let mut header = [0u8; CHUNK_HEADER_SIZE];
        header.copy_from_slice(&buffer[..CHUNK_HEADER_SIZE]);
        payload.copy_from_slice(&buffer[CHUNK_HEADER_SIZE..]);

        Ok(DiskChunkHeader::from_bytes(&header))
    }

    /// Physical length of the file in bytes
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Every byte in `[from, to)` is zero
    pub fn is_zeroed(&self, from: u64, to: u64) -> Result<bool> {
        let mut buffer = vec![0u8; SCAN_BUFFER_SIZE];
        let mut offset = from;

        while offset < to {
            let n = ((to - offset) as usize).min(SCAN_BUFFER_SIZE);
            self.file.read_exact_at(&mut buffer[..n], offset)?;
            if buffer[..n].iter().any(|&b| b != 0) {
                return Ok(false);
            }
            offset += n as u64;
        }
        Ok(true)
    }

    /// Physical length and number of 512-byte blocks in use
    pub fn size_and_blocks(&self) -> Result<(u64, u64)> {
        let metadata = self.file.metadata()?;
        Ok((metadata.len(), metadata.blocks()))
    }

    /// Grow or shrink the file to exactly `len` bytes
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Sync file contents (and the size, if it changed) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free the file's path now and unlink the file when this handle drops
    pub fn remove_on_close(&self) -> Result<()> {
        let mut tombstone = self.tombstone.lock();
        if tombstone.is_some() {
            return Ok(());
        }

        let parked = tombstone_path(&self.path);
        match std::fs::rename(&self.path, &parked) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Moved data file {:?} to {:?}", self.path, parked);
        *tombstone = Some(parked);
        Ok(())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if let Some(parked) = self.tombstone.get_mut().take() {
            match std::fs::remove_file(&parked) {
                Ok(()) => tracing::debug!("Removed data file {:?}", parked),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove data file {:?}: {}", parked, e),
            }
        }
    }
}
