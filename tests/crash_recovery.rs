//! Crash recovery tests
//!
//! A crash is simulated by injecting a fault between truncating the side file
//! and finishing the operation, or by damaging the files directly, then
//! reopening the store.

use datastore_rs::freelist::write_freelist_file;
use datastore_rs::{
    DataStoreError, DataStores, DataStoresConfig, DiskChunkHeader, Freelists, FREE_MAGIC,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use tempfile::TempDir;

fn init(dir: &TempDir) -> DataStores {
    let stores = DataStores::new();
    stores
        .init_data_stores(DataStoresConfig::new(dir.path()).min_alloc_size(64))
        .unwrap();
    stores
}

/// Allocate a small layout, write a payload into each chunk and flush
///
/// Returns (offset, allocated size, payload length) of the live chunks.
fn populate(stores: &DataStores, guid: u64) -> Vec<(u64, u64, usize)> {
    let store = stores.get_data_store(guid).unwrap();
    let mut chunks = Vec::new();
    for len in [10usize, 200, 40, 900, 40] {
        let chunk = store.allocate_space(len as u64).unwrap();
        store
            .write_data(chunk.offset, &vec![len as u8; len], chunk.allocated_size)
            .unwrap();
        chunks.push((chunk.offset, chunk.allocated_size, len));
    }
    let (offset, size, _) = chunks.remove(2);
    store.free_chunk(offset, size).unwrap();
    store.flush().unwrap();
    chunks
}

#[test]
fn test_fault_after_invalidate_recovers() {
    let dir = TempDir::new().unwrap();
    let (chunks, expected) = {
        let stores = init(&dir);
        let chunks = populate(&stores, 1);
        let store = stores.get_data_store(1).unwrap();
        let expected = store.freelist_snapshot();

        let listener = stores.error_listener();
        listener.inject();
        let (offset, size, _) = chunks[0];
        assert!(matches!(
            store.free_chunk(offset, size),
            Err(DataStoreError::InjectedFault(_))
        ));
        assert_eq!(listener.fired(), 1);
        // The free never happened
        assert_eq!(store.freelist_snapshot(), expected);

        // "Crash": drop everything without flushing
        (chunks, expected)
    };

    let stores = init(&dir);
    let store = stores.get_data_store(1).unwrap();
    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.freelist_snapshot(), expected);
    store.verify_freelist().unwrap();

    for &(offset, _, len) in &chunks {
        let mut buf = vec![0u8; len];
        store.read_data(offset, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == len as u8));
    }
}

#[test]
fn test_crash_mid_history_keeps_data() {
    let dir = TempDir::new().unwrap();
    let kept = {
        let stores = init(&dir);
        let store = stores.get_data_store(2).unwrap();
        store.flush().unwrap();

        let a = store.allocate_space(100).unwrap();
        store.write_data(a.offset, b"survives the crash", a.allocated_size).unwrap();
        let b = store.allocate_space(1000).unwrap();
        store.free_chunk(b.offset, b.allocated_size).unwrap();
        a
    };

    let stores = init(&dir);
    let store = stores.get_data_store(2).unwrap();
    assert_eq!(store.stats().rebuilds, 1);

    let mut buf = [0u8; 18];
    store.read_data(kept.offset, &mut buf).unwrap();
    assert_eq!(&buf, b"survives the crash");
    store.verify_freelist().unwrap();

    // The rebuilt free list is usable
    let again = store.allocate_space(1000).unwrap();
    assert_eq!(again.allocated_size, 1024);
    store.verify_freelist().unwrap();
}

#[test]
fn test_corrupt_side_file_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let stores = init(&dir);
        populate(&stores, 3);
        stores.get_data_store(3).unwrap().freelist_snapshot()
    };
    assert!(!expected.is_empty());

    let side_file = dir.path().join("3.data.fl");
    let mut bytes = std::fs::read(&side_file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5a;
    std::fs::write(&side_file, &bytes).unwrap();

    let stores = init(&dir);
    let store = stores.get_data_store(3).unwrap();
    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.freelist_snapshot(), expected);
    store.verify_freelist().unwrap();
}

#[test]
fn test_missing_side_file_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let stores = init(&dir);
        populate(&stores, 4);
        stores.get_data_store(4).unwrap().freelist_snapshot()
    };

    std::fs::remove_file(dir.path().join("4.data.fl")).unwrap();

    let stores = init(&dir);
    let store = stores.get_data_store(4).unwrap();
    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.freelist_snapshot(), expected);
}

#[test]
fn test_side_file_pointing_past_end_is_discarded() {
    let dir = TempDir::new().unwrap();
    let expected = {
        let stores = init(&dir);
        populate(&stores, 5);
        stores.get_data_store(5).unwrap().freelist_snapshot()
    };

    // Well-formed buckets that describe a file ten times larger
    let mut bogus = Freelists::new();
    bogus.entry(65536).or_default().insert(65536);
    write_freelist_file(&dir.path().join("5.data.fl"), &bogus).unwrap();

    let stores = init(&dir);
    let store = stores.get_data_store(5).unwrap();
    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.freelist_snapshot(), expected);
}

#[test]
fn test_torn_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    let logical_end = {
        let stores = init(&dir);
        populate(&stores, 6);
        let store = stores.get_data_store(6).unwrap();
        store.allocate_space(3000).unwrap();
        store.allocated_size()
    };

    // A later grow that extended the file but never wrote its header
    let data_path = dir.path().join("6.data");
    let mut file = OpenOptions::new().append(true).open(&data_path).unwrap();
    file.write_all(&[0u8; 4096]).unwrap();
    drop(file);

    let stores = init(&dir);
    let store = stores.get_data_store(6).unwrap();
    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.allocated_size(), logical_end);
    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), logical_end);
    store.verify_freelist().unwrap();
}

#[test]
fn test_verify_detects_overwritten_free_header() {
    let dir = TempDir::new().unwrap();
    let stores = init(&dir);
    populate(&stores, 7);
    let store = stores.get_data_store(7).unwrap();
    store.verify_freelist().unwrap();

    let freelists = store.freelist_snapshot();
    let (&size, offsets) = freelists.iter().next().unwrap();
    let offset = *offsets.iter().next().unwrap();

    // Right magic, wrong size
    let file = OpenOptions::new().write(true).open(store.path()).unwrap();
    let header = DiskChunkHeader { magic: FREE_MAGIC, size: size * 2 };
    file.write_all_at(&header.to_bytes(), offset).unwrap();

    assert!(matches!(
        store.verify_freelist(),
        Err(DataStoreError::FreelistCorrupted { offset: o, .. }) if o == offset
    ));
}

#[test]
fn test_rebuild_with_larger_min_alloc_keeps_data() {
    let dir = TempDir::new().unwrap();
    let (chunks, expected, file_len) = {
        let stores = init(&dir);
        let chunks = populate(&stores, 8);
        let store = stores.get_data_store(8).unwrap();
        (chunks, store.freelist_snapshot(), store.allocated_size())
    };
    std::fs::remove_file(dir.path().join("8.data.fl")).unwrap();

    let stores = DataStores::new();
    stores
        .init_data_stores(DataStoresConfig::new(dir.path()).min_alloc_size(512))
        .unwrap();
    let store = stores.get_data_store(8).unwrap();

    assert_eq!(store.stats().rebuilds, 1);
    assert_eq!(store.allocated_size(), file_len);
    assert_eq!(std::fs::metadata(store.path()).unwrap().len(), file_len);
    assert_eq!(store.freelist_snapshot(), expected);
    store.verify_freelist().unwrap();

    for &(offset, _, len) in &chunks {
        let mut buf = vec![0u8; len];
        store.read_data(offset, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == len as u8));
    }

    // Chunks smaller than the new minimum can still be freed
    let (offset, size, _) = chunks[0];
    assert_eq!(size, 64);
    store.free_chunk(offset, size).unwrap();
    store.verify_freelist().unwrap();
}

#[test]
fn test_bad_header_mid_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let (chunks, file_len) = {
        let stores = init(&dir);
        let chunks = populate(&stores, 9);
        let file_len = stores.get_data_store(9).unwrap().allocated_size();
        (chunks, file_len)
    };
    let (offset, _, _) = chunks[1];
    assert_eq!(offset, 256);

    let data_path = dir.path().join("9.data");
    let file = OpenOptions::new().write(true).open(&data_path).unwrap();
    file.write_all_at(&[0u8; 16], offset).unwrap();
    drop(file);
    std::fs::remove_file(dir.path().join("9.data.fl")).unwrap();

    let stores = init(&dir);
    assert!(matches!(
        stores.get_data_store(9),
        Err(DataStoreError::ChunkCorrupted { offset: 256, .. })
    ));
    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), file_len);
    assert!(stores.discover_data_stores().unwrap().contains(&9));
}
