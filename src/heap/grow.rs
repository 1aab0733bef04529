//! Growing and shrinking a heap's data block
//!
//! Both run with the heap locked and read-write protected. A grow either
//! completes or leaves the heap exactly as it was; a shrink is advisory and
//! gives up quietly.

use super::free_list::FreeBlock;
use super::local_heap::{HeapLayout, HeapRef, LocalHeap};
use crate::cache::CacheProtocolAdapter;
use crate::error::{Error, Result};
use crate::file::FileSpace;
use tracing::{debug, error, info, warn};

/// Where the new data block lives after a grow
enum Placement {
    InPlace,
    Relocated(u64),
}

/// Grow the data block so `need` bytes fit, and carve them out
///
/// `tail` is the index of the free block with the greatest offset, as
/// reported by the failed search. Returns the offset of the new allocation.
pub(crate) fn grow(
    heap: &HeapRef,
    state: &mut LocalHeap,
    need: usize,
    tail: Option<usize>,
    space: &dyn FileSpace,
    cache: &CacheProtocolAdapter,
) -> Result<usize> {
    let node = state.widths.free_node_size();
    let old_size = state.dblk_size();
    let tail = tail.and_then(|i| state.free_list.get(i).map(|b| (i, b)));
    let tail_at_end = tail.filter(|(_, b)| b.end() == old_size);

    // at least double, unless a small tail would just be stranded
    let mut need_more = need.max(old_size);
    if tail_at_end.is_none() && need_more < need + node {
        need_more = need;
    }
    let new_size = old_size + need_more;
    if new_size as u64 > state.widths.max_length() {
        return Err(Error::Allocation(format!(
            "Data block of {} bytes exceeds the length width",
            new_size
        )));
    }

    let placement = reserve(heap, state, need_more, new_size, space, cache)?;
    metrics::counter!("localheap_grow_total").increment(1);

    if let Placement::Relocated(new_addr) = placement {
        let old_addr = state.dblk_addr;
        if old_size > 0 {
            if let Err(e) = space.free(old_addr, old_size as u64) {
                warn!(old_addr, old_size, error = %e, "Failed to release old data block; space leaked");
            }
        }
        state.dblk_addr = new_addr;
        state.layout = HeapLayout::Split;
        metrics::counter!("localheap_relocations_total").increment(1);
        info!(
            prefix_addr = state.prefix_addr,
            old_addr, new_addr, new_size, "Relocated data block"
        );
    }
    state.image.resize(new_size, 0);

    let offset = match tail_at_end {
        Some((index, block)) => {
            let grown = FreeBlock::new(block.offset + need, block.size + need_more - need);
            if grown.size >= node {
                state.free_list.set(index, grown);
            } else {
                state.free_list.remove(index);
            }
            block.offset
        }
        None => {
            let rest = need_more - need;
            if rest >= node {
                state.free_list.push_front(FreeBlock::new(old_size + need, rest));
            }
            old_size
        }
    };

    debug!(
        prefix_addr = state.prefix_addr,
        old_size, new_size, offset, "Grew data block"
    );
    Ok(offset)
}

/// Obtain file space for `new_size` bytes and tell the cache
///
/// On any failure the file space and cache are back where they started.
fn reserve(
    heap: &HeapRef,
    state: &LocalHeap,
    need_more: usize,
    new_size: usize,
    space: &dyn FileSpace,
    cache: &CacheProtocolAdapter,
) -> Result<Placement> {
    let old_size = state.dblk_size() as u64;
    let (extent_addr, extent_len) = match state.layout {
        HeapLayout::Colocated => (state.prefix_addr, state.prefix_size() as u64 + old_size),
        HeapLayout::Split => (state.dblk_addr, old_size),
    };

    if !state.widths.fits_extent(extent_addr, extent_len + need_more as u64) {
        return Err(Error::Allocation(format!(
            "Extent {:#x}+{} is not addressable in {} bytes",
            extent_addr,
            extent_len + need_more as u64,
            state.widths.sizeof_addr()
        )));
    }
    if space.try_extend(extent_addr, extent_len, need_more as u64)? {
        if let Err(e) = cache.resize_data(state, new_size) {
            release_or_log(space, extent_addr + extent_len, need_more as u64);
            return Err(e);
        }
        return Ok(Placement::InPlace);
    }

    let new_addr = space.allocate(new_size as u64)?;
    if !state.widths.fits_extent(new_addr, new_size as u64) {
        release_or_log(space, new_addr, new_size as u64);
        return Err(Error::Allocation(format!(
            "Data block {:#x}+{} is not addressable in {} bytes",
            new_addr,
            new_size,
            state.widths.sizeof_addr()
        )));
    }
    let cached = match state.layout {
        HeapLayout::Colocated => cache.split_data_block(heap, state, new_addr, new_size),
        HeapLayout::Split => cache.move_data_block(state, new_addr, new_size),
    };
    if let Err(e) = cached {
        release_or_log(space, new_addr, new_size as u64);
        return Err(e);
    }

    // the in-memory image moves with the heap; nothing to copy on disk yet
    Ok(Placement::Relocated(new_addr))
}

fn release_or_log(space: &dyn FileSpace, addr: u64, len: u64) {
    if let Err(e) = space.free(addr, len) {
        error!(addr, len, error = %e, "Failed to return file space of an abandoned grow");
    }
}

/// Shrink the data block behind a large trailing free block, if worthwhile
///
/// Returns true when the heap shrank.
pub(crate) fn shrink(state: &mut LocalHeap, space: &dyn FileSpace, cache: &CacheProtocolAdapter) -> bool {
    let old_size = state.dblk_size();
    let Some(plan) = state
        .free_list
        .plan_minimize(old_size, state.widths.free_node_size())
    else {
        return false;
    };

    if let Err(e) = cache.resize_data(state, plan.new_size) {
        warn!(prefix_addr = state.prefix_addr, error = %e, "Skipping heap shrink: cache resize failed");
        return false;
    }
    let released = (old_size - plan.new_size) as u64;
    if let Err(e) = space.free(state.dblk_addr + plan.new_size as u64, released) {
        warn!(prefix_addr = state.prefix_addr, error = %e, "Skipping heap shrink: file space not released");
        if let Err(undo) = cache.resize_data(state, old_size) {
            error!(prefix_addr = state.prefix_addr, error = %undo, "Failed to restore cache entry size");
        }
        return false;
    }

    state.image.truncate(plan.new_size);
    state.free_list.apply_minimize(&plan);
    metrics::counter!("localheap_shrink_total").increment(1);
    debug!(
        prefix_addr = state.prefix_addr,
        old_size,
        new_size = plan.new_size,
        "Shrank data block"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, EntryKey, MetadataCache};
    use crate::config::ByteOrder;
    use crate::file::{ExtentAllocator, MemBlockIo};
    use crate::heap::codec::IntWidths;
    use crate::heap::free_list::{FreeList, Search};
    use crate::heap::local_heap::SharedHeap;
    use std::sync::Arc;

    struct Fixture {
        space: ExtentAllocator,
        cache: Arc<MetadataCache>,
        adapter: CacheProtocolAdapter,
        heap: HeapRef,
    }

    /// Colocated heap at address 0 with `dblk_size` bytes, registered and pinned
    fn fixture(dblk_size: usize) -> Fixture {
        fixture_with(IntWidths::new(8, 8, ByteOrder::Little).unwrap(), dblk_size)
    }

    fn fixture_with(widths: IntWidths, dblk_size: usize) -> Fixture {
        let state = LocalHeap::new(widths, 0, dblk_size);
        let space = ExtentAllocator::new(0);
        space.allocate((32 + dblk_size) as u64).unwrap();

        let cache = Arc::new(MetadataCache::new(Arc::new(MemBlockIo::new()), 16));
        let adapter = CacheProtocolAdapter::new(cache.clone());
        let heap = SharedHeap::new(state);
        {
            let mut state = heap.lock();
            adapter.insert_new(&heap, &state).unwrap();
            adapter.pin_heap(&heap, &state).unwrap();
            state.protect_count = 1;
        }
        Fixture {
            space,
            cache,
            adapter,
            heap,
        }
    }

    fn allocate(f: &Fixture, need: usize) -> Result<usize> {
        let mut state = f.heap.lock();
        let node = state.widths.free_node_size();
        match state.free_list.allocate(need, node) {
            Search::Placed(offset) => Ok(offset),
            Search::Exhausted { tail } => grow(&f.heap, &mut state, need, tail, &f.space, &f.adapter),
        }
    }

    #[test]
    fn test_grow_in_place_extends_tail_block() -> Result<()> {
        let f = fixture(32);
        assert_eq!(allocate(&f, 16)?, 0);

        // the 16-byte tail block is too small, so the heap doubles in place
        let offset = allocate(&f, 24)?;
        let state = f.heap.lock();
        assert_eq!(offset, 16);
        assert_eq!(state.dblk_size(), 64);
        assert_eq!(state.layout(), HeapLayout::Colocated);
        assert_eq!(state.free_list().blocks(), &[FreeBlock::new(40, 24)]);
        assert_eq!(f.cache.entry_len(EntryKey::prefix(0)), Some(32 + 64));
        Ok(())
    }

    #[test]
    fn test_grow_from_empty_heap() -> Result<()> {
        let f = fixture(0);
        assert_eq!(allocate(&f, 16)?, 0);
        let state = f.heap.lock();
        assert_eq!(state.dblk_size(), 16);
        assert!(state.free_list().is_empty());
        Ok(())
    }

    #[test]
    fn test_grow_relocates_and_splits() -> Result<()> {
        let f = fixture(32);
        // something else sits right behind the heap
        let blocker = f.space.allocate(64)?;
        assert_eq!(blocker, 64);

        {
            let mut state = f.heap.lock();
            state.image[..4].copy_from_slice(b"keep");
            state.free_list = FreeList::from_blocks(vec![FreeBlock::new(16, 16)]);
        }
        let offset = allocate(&f, 32)?;

        let state = f.heap.lock();
        assert_eq!(offset, 16);
        assert_eq!(state.layout(), HeapLayout::Split);
        assert_eq!(state.dblk_addr(), 128);
        assert_eq!(state.dblk_size(), 64);
        assert_eq!(&state.data()[..4], b"keep");
        assert_eq!(state.free_list().blocks(), &[FreeBlock::new(48, 16)]);

        assert_eq!(f.cache.entry_len(EntryKey::prefix(0)), Some(32));
        assert_eq!(f.cache.entry_len(EntryKey::data_block(128)), Some(64));
        assert_eq!(f.cache.pin_count(EntryKey::data_block(128)), 1);
        // old data bytes were handed back
        assert_eq!(f.space.free_extents(), vec![(32, 32)]);
        Ok(())
    }

    #[test]
    fn test_split_heap_moves_data_block() -> Result<()> {
        let f = fixture(32);
        f.space.allocate(64)?;
        allocate(&f, 32)?;
        allocate(&f, 16)?;
        f.space.allocate(32)?;

        // data block at 128 is no longer at EOA; next grow moves it again
        let before = f.heap.lock().dblk_addr();
        allocate(&f, 64)?;
        let state = f.heap.lock();
        assert_ne!(state.dblk_addr(), before);
        assert!(f.cache.contains(EntryKey::data_block(state.dblk_addr())));
        assert!(!f.cache.contains(EntryKey::data_block(before)));
        Ok(())
    }

    #[test]
    fn test_failed_grow_leaves_heap_unchanged() -> Result<()> {
        let f = fixture(32);
        f.space.set_limit(Some(64));
        allocate(&f, 32)?;

        let before = f.heap.lock().clone();
        assert!(matches!(allocate(&f, 64), Err(Error::Allocation(_))));
        let after = f.heap.lock();
        assert_eq!(after.dblk_size(), before.dblk_size());
        assert_eq!(after.free_list(), before.free_list());
        assert_eq!(after.layout(), before.layout());
        assert_eq!(f.cache.entry_len(EntryKey::prefix(0)), Some(64));
        Ok(())
    }

    #[test]
    fn test_grow_rejects_unaddressable_block() -> Result<()> {
        // 2-byte addresses: nothing may live at or past 0x10000
        let f = fixture_with(IntWidths::new(8, 2, ByteOrder::Little).unwrap(), 32);
        assert_eq!(f.heap.lock().prefix_size(), 32);
        f.space.allocate(0x10000 - 64)?;
        allocate(&f, 32)?;

        let before = f.heap.lock().clone();
        assert!(matches!(allocate(&f, 32), Err(Error::Allocation(_))));
        let after = f.heap.lock();
        assert_eq!(after.dblk_addr(), before.dblk_addr());
        assert_eq!(after.dblk_size(), 32);
        assert_eq!(after.layout(), HeapLayout::Colocated);
        assert_eq!(f.space.eoa(), 0x10000);
        assert_eq!(f.cache.entry_len(EntryKey::prefix(0)), Some(64));
        assert!(!f.cache.contains(EntryKey::data_block(0x10000)));
        Ok(())
    }

    #[test]
    fn test_shrink_releases_tail_space() -> Result<()> {
        let f = fixture(512);
        let mut state = f.heap.lock();
        state.free_list = FreeList::from_blocks(vec![FreeBlock::new(104, 408)]);

        assert!(shrink(&mut state, &f.space, &f.adapter));
        assert_eq!(state.dblk_size(), 128);
        assert_eq!(state.free_list().blocks(), &[FreeBlock::new(104, 24)]);
        assert_eq!(f.cache.entry_len(EntryKey::prefix(0)), Some(32 + 128));
        assert_eq!(f.space.eoa(), 32 + 128);

        // nothing left to give back
        assert!(!shrink(&mut state, &f.space, &f.adapter));
        Ok(())
    }

    #[test]
    fn test_shrink_is_advisory() -> Result<()> {
        let f = fixture(512);
        let mut state = f.heap.lock();
        state.free_list = FreeList::from_blocks(vec![FreeBlock::new(104, 408)]);
        // the heap's prefix entry vanished: the cache resize fails
        f.adapter.unpin_heap(&state)?;
        f.cache.evict(EntryKey::prefix(0))?;

        assert!(!shrink(&mut state, &f.space, &f.adapter));
        assert_eq!(state.dblk_size(), 512);
        assert_eq!(f.space.eoa(), 32 + 512);
        Ok(())
    }
}
