//! End-to-end local heap scenarios against the in-memory collaborators

use localheap::cache::{CacheManager, EntryKey, MetadataCache};
use localheap::error::{Error, Result};
use localheap::heap::{FreeBlock, HeapLayout};
use localheap::{AccessMode, BlockIo, ExtentAllocator, FileSpace, HeapConfig, LocalHeapStore, MemBlockIo};
use std::sync::Arc;

struct Fixture {
    io: Arc<MemBlockIo>,
    cache: Arc<MetadataCache>,
    store: LocalHeapStore,
}

fn fixture_with(config: HeapConfig, space: Arc<dyn FileSpace>) -> Fixture {
    let io = Arc::new(MemBlockIo::new());
    let cache = Arc::new(MetadataCache::new(io.clone(), config.cache_capacity));
    let store = LocalHeapStore::new(config, io.clone(), space, cache.clone()).expect("Failed to build store");
    Fixture { io, cache, store }
}

fn fixture() -> Fixture {
    fixture_with(HeapConfig::default(), Arc::new(ExtentAllocator::new(0)))
}

/// Fresh store over the same device, as after a restart
fn reopen(io: &Arc<MemBlockIo>) -> LocalHeapStore {
    let cache = Arc::new(MetadataCache::new(io.clone(), 64));
    let space = Arc::new(ExtentAllocator::new(io.len()));
    LocalHeapStore::new(HeapConfig::default(), io.clone(), space, cache).expect("Failed to reopen store")
}

#[test]
fn test_exact_fit_reuse() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(0)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;

    assert_eq!(heap.insert(b"ten bytes!")?, 0);
    assert_eq!(heap.insert(b"twenty bytes of data")?, 16);
    heap.remove(0, 10)?;
    assert_eq!(heap.insert(b"TEN BYTES!")?, 0);

    assert_eq!(heap.dblk_size(), 40);
    assert_eq!(heap.total_free(), 0);
    heap.unprotect()?;

    f.store.flush()?;
    let store = reopen(&f.io);
    let heap = store.protect_read(addr)?;
    assert_eq!(heap.read(0, 10)?, b"TEN BYTES!");
    assert_eq!(heap.read(16, 20)?, b"twenty bytes of data");
    Ok(())
}

#[test]
fn test_coalesced_regions_fit_without_growth() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(128)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;

    let offsets: Vec<usize> = (0u8..6)
        .map(|i| heap.insert(&[b'a' + i; 16]))
        .collect::<Result<_>>()?;
    assert_eq!(offsets, vec![0, 16, 32, 48, 64, 80]);

    for &offset in offsets.iter().skip(1).step_by(2) {
        heap.remove(offset, 16)?;
    }
    // 16 and 48 become one region with 32 between them
    heap.remove(32, 16)?;
    let report = heap.report();
    assert_eq!(report.free_blocks, vec![FreeBlock::new(16, 48), FreeBlock::new(80, 48)]);

    assert_eq!(heap.insert(&[b'z'; 48])?, 16);
    assert_eq!(heap.dblk_size(), 128);
    assert_eq!(heap.read(0, 16)?, vec![b'a'; 16]);
    assert_eq!(heap.read(64, 16)?, vec![b'e'; 16]);
    Ok(())
}

#[test]
fn test_growth_keeps_earlier_offsets() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(32)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;

    let blobs: Vec<Vec<u8>> = (0u8..3).map(|i| vec![b'0' + i; 24]).collect();
    let mut offsets = Vec::new();
    let mut sizes = Vec::new();
    for blob in &blobs {
        offsets.push(heap.insert(blob)?);
        sizes.push(heap.dblk_size());
    }

    assert_eq!(offsets, vec![0, 24, 48]);
    // each grow doubles the data block
    assert_eq!(sizes, vec![64, 64, 128]);
    for (offset, blob) in offsets.iter().zip(&blobs) {
        assert_eq!(&heap.read(*offset, 24)?, blob);
    }
    heap.unprotect()?;

    f.store.flush()?;
    let store = reopen(&f.io);
    let heap = store.protect_read(addr)?;
    assert_eq!(heap.dblk_size(), 128);
    for (offset, blob) in offsets.iter().zip(&blobs) {
        assert_eq!(&heap.read(*offset, 24)?, blob);
    }
    Ok(())
}

#[test]
fn test_large_tail_region_shrinks_heap() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(512)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;

    let keep = heap.insert(&[7u8; 100])?;
    let temp = heap.insert(b"scratch")?;
    assert_eq!((keep, temp), (0, 104));

    heap.remove(temp, 7)?;
    assert_eq!(heap.dblk_size(), 128);
    assert_eq!(heap.report().free_blocks, vec![FreeBlock::new(104, 24)]);
    heap.unprotect()?;

    assert_eq!(f.store.heap_storage_size(addr)?, 32 + 128);
    f.store.flush()?;

    let store = reopen(&f.io);
    let heap = store.protect_read(addr)?;
    assert_eq!(heap.dblk_size(), 128);
    assert_eq!(heap.read(keep, 100)?, vec![7u8; 100]);
    assert_eq!(heap.total_free(), 24);
    Ok(())
}

#[test]
fn test_round_trip_preserves_free_list() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(256)?;
    {
        let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;
        for i in 0u8..8 {
            heap.insert(&[i; 20])?;
        }
        heap.remove(0, 20)?;
        heap.remove(96, 20)?;
    }
    let before = f.store.report(addr)?;
    f.store.flush()?;

    let after = reopen(&f.io).report(addr)?;
    assert_eq!(after.dblk_size, before.dblk_size);
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.layout, HeapLayout::Colocated);
    Ok(())
}

#[test]
fn test_insert_then_remove_restores_coverage() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(256)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;
    heap.insert(&[1u8; 40])?;
    let hole = heap.insert(&[2u8; 40])?;
    heap.insert(&[3u8; 40])?;
    heap.remove(hole, 40)?;

    let free_before = heap.total_free();
    let mut blocks_before = heap.report().free_blocks;
    blocks_before.sort_by_key(|b| b.offset);

    // splits the interior hole, then merges back into its remainder
    let offset = heap.insert(&[4u8; 21])?;
    assert_eq!(offset, hole);
    heap.remove(offset, 21)?;

    let mut blocks_after = heap.report().free_blocks;
    blocks_after.sort_by_key(|b| b.offset);
    assert_eq!(heap.total_free(), free_before);
    assert_eq!(blocks_after, blocks_before);
    Ok(())
}

#[test]
fn test_small_remove_is_abandoned() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(64)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;
    for _ in 0..3 {
        heap.insert(b"8 bytes")?;
    }

    // 8 bytes touching no free block cannot hold a free node
    heap.remove(8, 8)?;
    assert_eq!(heap.report().free_blocks, vec![FreeBlock::new(24, 40)]);
    assert_eq!(heap.total_free(), 40);

    // the neighbour still merges into the free tail
    heap.remove(16, 8)?;
    assert_eq!(heap.report().free_blocks, vec![FreeBlock::new(16, 48)]);

    // abandoned ranges never rejoin the list
    heap.remove(0, 8)?;
    assert_eq!(heap.total_free(), 48);
    assert_eq!(heap.dblk_size(), 64);
    Ok(())
}

#[test]
fn test_relocated_heap_round_trips_split() -> Result<()> {
    let f = fixture();
    let a = f.store.create(32)?;
    let b = f.store.create(32)?;
    assert_eq!((a, b), (0, 64));

    let blob = b"this blob forces a grow\0";
    {
        let mut heap = f.store.protect(a, AccessMode::ReadWrite)?;
        assert_eq!(heap.insert(blob)?, 0);
        let report = heap.report();
        assert_eq!(report.layout, HeapLayout::Split);
        assert_eq!(report.dblk_addr, 128);
        assert!(f.cache.contains(EntryKey::data_block(128)));
    }
    f.store.flush()?;

    let store = reopen(&f.io);
    let heap = store.protect_read(a)?;
    let report = heap.report();
    assert_eq!(report.layout, HeapLayout::Split);
    assert_eq!(report.dblk_addr, 128);
    assert_eq!(report.dblk_size, 64);
    assert_eq!(report.free_blocks, vec![FreeBlock::new(24, 40)]);
    assert_eq!(heap.read(0, blob.len())?, blob);

    // the other heap was not disturbed
    assert_eq!(store.get_size(b)?, 32);
    Ok(())
}

#[test]
fn test_nested_protection_pins_split_heap_once() -> Result<()> {
    let f = fixture();
    let a = f.store.create(32)?;
    f.store.create(32)?;
    f.store.protect(a, AccessMode::ReadWrite)?.insert(&[9u8; 24])?;

    let prefix = EntryKey::prefix(a);
    let dblk = EntryKey::data_block(128);
    assert_eq!(f.cache.pin_count(prefix), 0);
    assert_eq!(f.cache.pin_count(dblk), 0);

    let outer = f.store.protect_read(a)?;
    let inner = f.store.protect_read(a)?;
    assert_eq!(f.cache.pin_count(prefix), 1);
    assert_eq!(f.cache.pin_count(dblk), 1);

    inner.unprotect()?;
    assert_eq!(f.cache.pin_count(dblk), 1);
    outer.unprotect()?;
    assert_eq!(f.cache.pin_count(prefix), 0);
    assert_eq!(f.cache.pin_count(dblk), 0);
    Ok(())
}

#[test]
fn test_evicted_entries_reload() -> Result<()> {
    let config = HeapConfig {
        cache_capacity: 1,
        ..HeapConfig::default()
    };
    let f = fixture_with(config, Arc::new(ExtentAllocator::new(0)));

    let a = f.store.create(32)?;
    f.store.protect(a, AccessMode::ReadWrite)?.insert(b"first\0")?;
    let b = f.store.create(32)?;
    f.store.protect(b, AccessMode::ReadWrite)?.insert(b"second\0")?;

    // a was written back when b arrived; b goes when a comes back
    assert_eq!(&f.io.read_at(a, 4)?[..], b"HEAP");
    let heap = f.store.protect_read(a)?;
    assert_eq!(heap.read(0, 6)?, b"first\0");
    heap.unprotect()?;

    let stats = f.store.cache_stats();
    assert!(stats.evictions >= 2);
    assert!(stats.misses >= 1);

    f.store.flush()?;
    let store = reopen(&f.io);
    assert_eq!(store.protect_read(b)?.read(0, 7)?, b"second\0");
    Ok(())
}

#[test]
fn test_evicted_data_block_reattaches() -> Result<()> {
    let config = HeapConfig {
        cache_capacity: 2,
        ..HeapConfig::default()
    };
    let f = fixture_with(config, Arc::new(ExtentAllocator::new(0)));
    let a = f.store.create(32)?;
    let b = f.store.create(32)?;

    // relocation adds a third entry, pushing b out
    f.store.protect(a, AccessMode::ReadWrite)?.insert(&[5u8; 24])?;
    assert!(!f.cache.contains(EntryKey::prefix(b)));

    // loading b pushes out a's data block; a's prefix must stay behind it
    f.store.get_size(b)?;
    let dblk = EntryKey::data_block(128);
    assert!(!f.cache.contains(dblk));
    assert!(f.cache.contains(EntryKey::prefix(a)));

    let heap = f.store.protect_read(a)?;
    assert!(f.cache.contains(dblk));
    assert_eq!(f.cache.pin_count(dblk), 1);
    assert_eq!(heap.read(0, 24)?, vec![5u8; 24]);
    Ok(())
}

#[test]
fn test_failed_grow_leaves_heap_unchanged() -> Result<()> {
    let f = fixture_with(HeapConfig::default(), Arc::new(ExtentAllocator::with_limit(0, 64)));
    let addr = f.store.create(32)?;
    let mut heap = f.store.protect(addr, AccessMode::ReadWrite)?;
    heap.insert(&[4u8; 32])?;

    let before = heap.report();
    assert!(matches!(heap.insert(b"overflow"), Err(Error::Allocation(_))));
    let after = heap.report();
    assert_eq!(after.dblk_size, before.dblk_size);
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.layout, before.layout);
    heap.unprotect()?;

    f.store.flush()?;
    let heap = reopen(&f.io).protect_read(addr)?.read(0, 32)?;
    assert_eq!(heap, vec![4u8; 32]);
    Ok(())
}

#[test]
fn test_corrupt_images_are_rejected() -> Result<()> {
    let f = fixture();
    let addr = f.store.create(32)?;
    f.store.flush()?;
    let good = f.io.snapshot();

    let corruptions: [(usize, u8); 3] = [
        (0, b'X'), // magic
        (4, 1),    // version
        (16, 200), // free list head past the data block
    ];
    for (at, value) in corruptions {
        let io = Arc::new(MemBlockIo::new());
        let mut image = good.clone();
        image[at] = value;
        io.write_at(0, &image)?;
        assert!(matches!(
            reopen(&io).protect_read(addr),
            Err(Error::CorruptFormat(_))
        ));
    }

    // free node at data offset 0 claims to run past the block
    let io = Arc::new(MemBlockIo::new());
    let mut image = good.clone();
    image[32 + 8] = 64;
    io.write_at(0, &image)?;
    assert!(matches!(
        reopen(&io).protect_read(addr),
        Err(Error::CorruptFormat(_))
    ));

    // data block sizes that overflow or run past the device
    for dblk_size in [u64::MAX - 8, 1 << 40] {
        let io = Arc::new(MemBlockIo::new());
        let mut image = good.clone();
        image[8..16].copy_from_slice(&dblk_size.to_le_bytes());
        io.write_at(0, &image)?;
        assert!(matches!(
            reopen(&io).protect_read(addr),
            Err(Error::CorruptFormat(_))
        ));
    }

    assert!(matches!(
        reopen(&f.io).protect_read(4096),
        Err(Error::NotFound(_))
    ));
    Ok(())
}

#[test]
fn test_delete_then_reuse_space() -> Result<()> {
    let f = fixture();
    let a = f.store.create(64)?;
    f.store.protect(a, AccessMode::ReadWrite)?.insert(b"gone soon")?;
    f.store.delete(a)?;
    assert!(!f.cache.contains(EntryKey::prefix(a)));

    // the released extent is handed out again
    let b = f.store.create(64)?;
    assert_eq!(b, a);
    assert_eq!(f.store.get_size(b)?, 64);
    Ok(())
}

#[test]
fn test_narrow_widths_round_trip() -> Result<()> {
    let config = HeapConfig {
        sizeof_size: 2,
        sizeof_addr: 4,
        byte_order: localheap::ByteOrder::Big,
        ..HeapConfig::default()
    };
    let f = fixture_with(config.clone(), Arc::new(ExtentAllocator::new(0)));
    let addr = f.store.create(0)?;
    let offset = f.store.protect(addr, AccessMode::ReadWrite)?.insert(b"narrow")?;
    f.store.flush()?;

    let cache = Arc::new(MetadataCache::new(f.io.clone(), 8));
    let store = LocalHeapStore::new(config, f.io.clone(), Arc::new(ExtentAllocator::new(f.io.len())), cache)?;
    assert_eq!(store.protect_read(addr)?.read(offset, 6)?, b"narrow");
    Ok(())
}
