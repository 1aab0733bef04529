//! Glue between heap lifecycle events and the cache manager
//!
//! Every cache call made on behalf of a heap goes through here, keyed by the
//! heap's current layout.

use super::{AccessMode, CacheManager, CacheStats, EntryKey};
use crate::error::Result;
use crate::heap::entry::HeapEntry;
use crate::heap::local_heap::{HeapRef, LocalHeap, SharedHeap};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub struct CacheProtocolAdapter {
    cache: Arc<dyn CacheManager>,
}

impl CacheProtocolAdapter {
    pub fn new(cache: Arc<dyn CacheManager>) -> Self {
        Self { cache }
    }

    /// Register a freshly created heap: one dirty, unpinned prefix entry
    pub fn insert_new(&self, heap: &HeapRef, state: &LocalHeap) -> Result<()> {
        self.cache.insert(
            EntryKey::prefix(state.prefix_addr()),
            HeapEntry::prefix(heap.clone()),
            state.prefix_image_len(),
            false,
        )
    }

    /// Protect the prefix entry at `addr`, loading the heap on a miss
    ///
    /// The entry stays protected until [`CacheProtocolAdapter::release_prefix`].
    pub fn fetch_prefix<F>(&self, addr: u64, mode: AccessMode, mut load: F) -> Result<HeapRef>
    where
        F: FnMut() -> Result<LocalHeap>,
    {
        let mut loader = || -> Result<(HeapEntry, usize)> {
            let state = load()?;
            let len = state.prefix_image_len();
            Ok((HeapEntry::prefix(SharedHeap::new(state)), len))
        };
        let entry = self.cache.protect(EntryKey::prefix(addr), mode, &mut loader)?;
        Ok(entry.heap().clone())
    }

    pub fn release_prefix(&self, addr: u64) -> Result<()> {
        self.cache.unprotect(EntryKey::prefix(addr), false)
    }

    /// Pin every entry of the heap, bringing back an evicted data block entry
    pub fn pin_heap(&self, heap: &HeapRef, state: &LocalHeap) -> Result<()> {
        let prefix = EntryKey::prefix(state.prefix_addr());
        self.cache.pin(prefix)?;
        if state.is_single_cache_object() {
            return Ok(());
        }

        let dblk = EntryKey::data_block(state.dblk_addr());
        let pinned = self.pin_data_block(heap, state, dblk);
        if let Err(e) = pinned {
            if let Err(undo) = self.cache.unpin(prefix) {
                error!(key = %prefix, error = %undo, "Failed to unpin prefix after data block pin failure");
            }
            return Err(e);
        }
        Ok(())
    }

    fn pin_data_block(&self, heap: &HeapRef, state: &LocalHeap, key: EntryKey) -> Result<()> {
        let len = state.dblk_size();
        let mut loader = || -> Result<(HeapEntry, usize)> { Ok((HeapEntry::data_block(heap.clone()), len)) };
        self.cache.protect(key, AccessMode::ReadOnly, &mut loader)?;

        let pinned = self.cache.pin(key);
        let released = self.cache.unprotect(key, false);
        pinned?;
        released
    }

    /// Unpin every entry of the heap; all unpins are attempted
    pub fn unpin_heap(&self, state: &LocalHeap) -> Result<()> {
        let prefix = self.cache.unpin(EntryKey::prefix(state.prefix_addr()));
        if state.is_single_cache_object() {
            return prefix;
        }
        let dblk = self.cache.unpin(EntryKey::data_block(state.dblk_addr()));
        prefix.and(dblk)
    }

    /// Mark every entry of the heap dirty ahead of a mutation
    pub fn mark_dirty(&self, state: &LocalHeap) -> Result<()> {
        self.cache.mark_dirty(EntryKey::prefix(state.prefix_addr()))?;
        if !state.is_single_cache_object() {
            self.cache.mark_dirty(EntryKey::data_block(state.dblk_addr()))?;
        }
        Ok(())
    }

    /// Announce a new data block size for the entry that carries the data
    pub fn resize_data(&self, state: &LocalHeap, dblk_size: usize) -> Result<()> {
        if state.is_single_cache_object() {
            self.cache.resize(
                EntryKey::prefix(state.prefix_addr()),
                state.prefix_size() + dblk_size,
            )
        } else {
            self.cache
                .resize(EntryKey::data_block(state.dblk_addr()), dblk_size)
        }
    }

    /// Turn a colocated heap into a split one whose data block lives at
    /// `new_addr`
    pub fn split_data_block(
        &self,
        heap: &HeapRef,
        state: &LocalHeap,
        new_addr: u64,
        dblk_size: usize,
    ) -> Result<()> {
        let prefix = EntryKey::prefix(state.prefix_addr());
        self.cache.resize(prefix, state.prefix_size())?;

        let pinned = state.protect_count() > 0;
        let inserted = self.cache.insert(
            EntryKey::data_block(new_addr),
            HeapEntry::data_block(heap.clone()),
            dblk_size,
            pinned,
        );
        if let Err(e) = inserted {
            if let Err(undo) = self.cache.resize(prefix, state.prefix_image_len()) {
                error!(key = %prefix, error = %undo, "Failed to restore prefix size");
            }
            return Err(e);
        }

        debug!(prefix_addr = state.prefix_addr(), new_addr, "Split data block from prefix");
        Ok(())
    }

    /// Resize and re-key the data block entry of a split heap
    pub fn move_data_block(&self, state: &LocalHeap, new_addr: u64, dblk_size: usize) -> Result<()> {
        let old = EntryKey::data_block(state.dblk_addr());
        self.cache.resize(old, dblk_size)?;
        if let Err(e) = self.cache.move_entry(old, new_addr) {
            if let Err(undo) = self.cache.resize(old, state.dblk_size()) {
                error!(key = %old, error = %undo, "Failed to restore data block size");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop the heap's entries without writing them back
    pub fn evict_heap(&self, state: &LocalHeap) -> Result<()> {
        if !state.is_single_cache_object() {
            let dblk = EntryKey::data_block(state.dblk_addr());
            if self.cache.contains(dblk) {
                self.cache.evict(dblk)?;
            }
        }
        self.cache.evict(EntryKey::prefix(state.prefix_addr()))
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
