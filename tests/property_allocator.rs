//! Property-based tests for allocator correctness
//!
//! Random allocate/free histories must always leave the file tiled by
//! aligned chunks whose headers agree with the in-memory free list.

use datastore_rs::{DataStore, DataStoreContext, DiskChunkHeader, Freelists, CHUNK_HEADER_SIZE};
use proptest::prelude::*;
use std::collections::BTreeSet;
use tempfile::TempDir;

const MIN_ALLOC: u64 = 64;

/// Walk the chunk headers on disk: (offset, size, is_free)
fn disk_chunks(store: &DataStore) -> Vec<(u64, u64, bool)> {
    let bytes = std::fs::read(store.path()).unwrap();
    let end = store.allocated_size();
    assert_eq!(bytes.len() as u64, end, "physical length differs from logical end");

    let mut chunks = Vec::new();
    let mut offset = 0u64;
    while offset < end {
        let at = offset as usize;
        let raw: [u8; CHUNK_HEADER_SIZE] = bytes[at..at + CHUNK_HEADER_SIZE].try_into().unwrap();
        let header = DiskChunkHeader::from_bytes(&raw);

        assert!(header.is_valid(), "bad magic at {}", offset);
        assert!(header.size.is_power_of_two() && header.size >= MIN_ALLOC);
        assert_eq!(offset % header.size, 0, "chunk at {} not aligned", offset);

        chunks.push((offset, header.size, header.is_free()));
        offset += header.size;
    }
    assert_eq!(offset, end, "chunks overrun the logical end");
    chunks
}

fn assert_tiling(store: &DataStore, live: &[(u64, u64, u8)]) {
    let chunks = disk_chunks(store);

    let mut on_disk = Freelists::new();
    let mut used = BTreeSet::new();
    for &(offset, size, free) in &chunks {
        if free {
            on_disk.entry(size).or_default().insert(offset);
        } else {
            used.insert((offset, size));
        }
    }

    assert_eq!(on_disk, store.freelist_snapshot());
    let expected: BTreeSet<_> = live.iter().map(|&(offset, size, _)| (offset, size)).collect();
    assert_eq!(used, expected);

    let largest = store.freelist_snapshot().keys().next_back().copied().unwrap_or(0);
    assert_eq!(store.largest_free_chunk(), largest);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_history_keeps_tiling(
        ops in prop::collection::vec((any::<bool>(), 1u64..5000, any::<prop::sample::Index>()), 1..60)
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.data");
        let store = DataStore::open(&path, 1, DataStoreContext::standalone(MIN_ALLOC)).unwrap();
        let mut live: Vec<(u64, u64, u8)> = Vec::new();

        for (i, (allocate, size, index)) in ops.iter().enumerate() {
            if *allocate || live.is_empty() {
                let chunk = store.allocate_space(*size).unwrap();
                prop_assert!(chunk.allocated_size.is_power_of_two());
                prop_assert!(chunk.allocated_size >= size + CHUNK_HEADER_SIZE as u64);
                prop_assert!(chunk.allocated_size >= MIN_ALLOC);
                prop_assert_eq!(chunk.offset % chunk.allocated_size, 0);

                let tag = i as u8;
                store.write_data(chunk.offset, &[tag; 8], chunk.allocated_size).unwrap();
                live.push((chunk.offset, chunk.allocated_size, tag));
            } else {
                let (offset, size, _) = live.swap_remove(index.index(live.len()));
                store.free_chunk(offset, size).unwrap();
            }
        }

        assert_tiling(&store, &live);
        store.verify_freelist().unwrap();

        for &(offset, _, tag) in &live {
            let mut buf = [0u8; 8];
            store.read_data(offset, &mut buf).unwrap();
            prop_assert_eq!(buf, [tag; 8]);
        }

        let sizes = store.get_sizes().unwrap();
        let free: u64 = store.freelist_snapshot().iter().map(|(k, v)| k * v.len() as u64).sum();
        let used: u64 = live.iter().map(|&(_, size, _)| size).sum();
        prop_assert_eq!(sizes.free_bytes, free);
        prop_assert_eq!(sizes.reserved_bytes, free + used);

        // Persist, reopen, and get the same free list back
        store.flush().unwrap();
        let expected = store.freelist_snapshot();
        drop(store);

        let reopened = DataStore::open(&path, 1, DataStoreContext::standalone(MIN_ALLOC)).unwrap();
        prop_assert_eq!(reopened.freelist_snapshot(), expected);
        assert_tiling(&reopened, &live);
    }

    #[test]
    fn prop_unflushed_history_rebuilds(
        sizes in prop::collection::vec(1u64..3000, 1..30),
        frees in prop::collection::vec(any::<prop::sample::Index>(), 0..20)
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2.data");
        let store = DataStore::open(&path, 2, DataStoreContext::standalone(MIN_ALLOC)).unwrap();
        store.flush().unwrap();

        let mut live: Vec<(u64, u64, u8)> = sizes
            .iter()
            .map(|&size| {
                let chunk = store.allocate_space(size).unwrap();
                (chunk.offset, chunk.allocated_size, 0)
            })
            .collect();
        for index in &frees {
            if live.is_empty() {
                break;
            }
            let (offset, size, _) = live.swap_remove(index.index(live.len()));
            store.free_chunk(offset, size).unwrap();
        }

        // No flush: the side file was invalidated and must not be trusted
        let expected = store.freelist_snapshot();
        drop(store);

        let reopened = DataStore::open(&path, 2, DataStoreContext::standalone(MIN_ALLOC)).unwrap();
        prop_assert_eq!(reopened.stats().rebuilds, 1);
        prop_assert_eq!(reopened.freelist_snapshot(), expected);
        assert_tiling(&reopened, &live);
    }
}

#[test]
fn test_allocation_reuse_scenario() {
    let dir = TempDir::new().unwrap();
    let store = DataStore::open(dir.path().join("3.data"), 3, DataStoreContext::standalone(64)).unwrap();

    let chunk = store.allocate_space(100).unwrap();
    assert_eq!((chunk.offset, chunk.allocated_size), (0, 128));
    assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 128);

    store.free_chunk(0, 128).unwrap();
    let again = store.allocate_space(100).unwrap();
    assert_eq!(again.offset, 0);
    assert_eq!(std::fs::metadata(store.path()).unwrap().len(), 128);
}
