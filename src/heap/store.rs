//! Heap lifecycle: create, protect, mutate, delete
//!
//! `LocalHeapStore` ties one block device, one file-space allocator and one
//! metadata cache together. Heaps are addressed by their prefix address and
//! are only touched through a [`HeapGuard`], which pins the heap's cache
//! entries for as long as it lives.

use super::codec::{align, IntWidths, HEAP_ALIGNMENT};
use super::debug::HeapReport;
use super::free_list::{Release, Search};
use super::grow;
use super::local_heap::{HeapRef, LocalHeap, SharedHeap};
use crate::cache::{AccessMode, CacheManager, CacheProtocolAdapter, CacheStats, MetadataCache};
use crate::config::HeapConfig;
use crate::error::{Error, Result};
use crate::file::{BlockIo, ExtentAllocator, FileBlockIo, FileSpace, MemBlockIo};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Entry point for working with local heaps in one file
pub struct LocalHeapStore {
    config: HeapConfig,
    widths: IntWidths,
    space: Arc<dyn FileSpace>,
    io: Arc<dyn BlockIo>,
    cache: CacheProtocolAdapter,
}

impl LocalHeapStore {
    /// Assemble a store from its collaborators
    pub fn new(
        config: HeapConfig,
        io: Arc<dyn BlockIo>,
        space: Arc<dyn FileSpace>,
        cache: Arc<dyn CacheManager>,
    ) -> Result<Self> {
        config.validate()?;
        let widths = config.widths()?;

        Ok(Self {
            config,
            widths,
            space,
            io,
            cache: CacheProtocolAdapter::new(cache),
        })
    }

    /// Store over a fresh in-memory device
    pub fn in_memory(config: HeapConfig) -> Result<Self> {
        let io: Arc<dyn BlockIo> = Arc::new(MemBlockIo::new());
        let cache = Arc::new(MetadataCache::new(io.clone(), config.cache_capacity));
        Self::new(config, io, Arc::new(ExtentAllocator::new(0)), cache)
    }

    /// Store over the file at `path`; new space is allocated past its end
    pub fn open<P: AsRef<Path>>(path: P, config: HeapConfig) -> Result<Self> {
        let file = FileBlockIo::open(path)?;
        let space = Arc::new(ExtentAllocator::new(file.len()));
        let io: Arc<dyn BlockIo> = Arc::new(file);
        let cache = Arc::new(MetadataCache::new(io.clone(), config.cache_capacity));
        Self::new(config, io, space, cache)
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn widths(&self) -> &IntWidths {
        &self.widths
    }

    pub fn io(&self) -> &Arc<dyn BlockIo> {
        &self.io
    }

    /// Create a heap whose data block starts out `size_hint` bytes long
    ///
    /// Returns the prefix address. A non-zero hint is raised to one free node
    /// and aligned.
    pub fn create(&self, size_hint: usize) -> Result<u64> {
        let node = self.widths.free_node_size();
        let dblk_size = align(if size_hint > 0 { size_hint.max(node) } else { 0 });
        if dblk_size as u64 > self.widths.max_length() {
            return Err(Error::Allocation(format!(
                "Size hint {} exceeds the length width",
                size_hint
            )));
        }

        let extent = (self.widths.prefix_size() + dblk_size) as u64;
        let addr = self.space.allocate(extent)?;
        if !self.widths.fits_extent(addr, extent) {
            if let Err(undo) = self.space.free(addr, extent) {
                error!(addr, error = %undo, "Failed to release space of uncreated heap");
            }
            return Err(Error::Allocation(format!(
                "Heap at {:#x}+{} is not addressable in {} bytes",
                addr,
                extent,
                self.widths.sizeof_addr()
            )));
        }
        let heap = SharedHeap::new(LocalHeap::new(self.widths, addr, dblk_size));

        let inserted = {
            let state = heap.lock();
            self.cache.insert_new(&heap, &state)
        };
        if let Err(e) = inserted {
            if let Err(undo) = self.space.free(addr, extent) {
                error!(addr, error = %undo, "Failed to release space of uncreated heap");
            }
            return Err(e);
        }

        info!(addr, dblk_size, "Created local heap");
        Ok(addr)
    }

    /// Protect the heap at `addr`, loading it on a cache miss
    pub fn protect(&self, addr: u64, mode: AccessMode) -> Result<HeapGuard<'_>> {
        let widths = self.widths;
        let read_len = self.config.speculative_read_size;
        let io = self.io.clone();
        let heap = self
            .cache
            .fetch_prefix(addr, mode, || LocalHeap::load(io.as_ref(), widths, addr, read_len))?;

        let entered = self.enter(&heap);
        let released = self.cache.release_prefix(addr);
        match (entered, released) {
            (Ok(()), Ok(())) => Ok(HeapGuard {
                store: self,
                heap,
                addr,
                mode,
                released: false,
            }),
            (Ok(()), Err(e)) => {
                if let Err(undo) = self.leave(&heap) {
                    error!(addr, error = %undo, "Failed to unprotect heap while unwinding");
                }
                Err(e)
            }
            (Err(e), released) => {
                if let Err(undo) = released {
                    error!(addr, error = %undo, "Failed to release prefix while unwinding");
                }
                Err(e)
            }
        }
    }

    pub fn protect_read(&self, addr: u64) -> Result<HeapGuard<'_>> {
        self.protect(addr, AccessMode::ReadOnly)
    }

    fn enter(&self, heap: &HeapRef) -> Result<()> {
        let mut state = heap.lock();
        if state.is_deleted() {
            return Err(Error::NotFound(format!(
                "Heap at {:#x} was deleted",
                state.prefix_addr()
            )));
        }
        if state.protect_count == 0 {
            self.cache.pin_heap(heap, &state)?;
        }
        state.protect_count += 1;
        Ok(())
    }

    fn leave(&self, heap: &HeapRef) -> Result<()> {
        let mut state = heap.lock();
        if state.protect_count == 0 {
            return Err(Error::InvariantViolation(format!(
                "Heap at {:#x} is not protected",
                state.prefix_addr()
            )));
        }
        state.protect_count -= 1;
        if state.protect_count == 0 {
            self.cache.unpin_heap(&state)?;
        }
        Ok(())
    }

    /// Current data block size of the heap at `addr`
    pub fn get_size(&self, addr: u64) -> Result<usize> {
        let guard = self.protect_read(addr)?;
        let size = guard.dblk_size();
        guard.unprotect()?;
        Ok(size)
    }

    /// File bytes taken by the heap at `addr`: prefix plus data block
    pub fn heap_storage_size(&self, addr: u64) -> Result<usize> {
        let guard = self.protect_read(addr)?;
        let size = guard.heap.lock().storage_size();
        guard.unprotect()?;
        Ok(size)
    }

    /// Release the heap's file space and drop it from the cache
    ///
    /// Fails if anyone else holds the heap protected.
    pub fn delete(&self, addr: u64) -> Result<()> {
        let guard = self.protect(addr, AccessMode::ReadWrite)?;
        {
            let state = guard.heap.lock();
            if state.protect_count > 1 {
                return Err(Error::InvariantViolation(format!(
                    "Heap at {:#x} is protected elsewhere",
                    addr
                )));
            }

            // once the prefix space is gone the heap is gone; a data block
            // that cannot be released afterwards is leaked, never freed twice
            self.space.free(addr, state.prefix_image_len() as u64)?;
            if !state.is_single_cache_object() && state.dblk_size() > 0 {
                let (dblk_addr, dblk_size) = (state.dblk_addr(), state.dblk_size());
                if let Err(e) = self.space.free(dblk_addr, dblk_size as u64) {
                    warn!(addr, dblk_addr, dblk_size, error = %e, "Failed to release data block of deleted heap; space leaked");
                }
            }
        }

        guard.finish_delete()?;
        info!(addr, "Deleted local heap");
        Ok(())
    }

    /// Write every dirty heap back to the device
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Inspection snapshot of the heap at `addr`
    pub fn report(&self, addr: u64) -> Result<HeapReport> {
        let guard = self.protect_read(addr)?;
        let report = guard.report();
        guard.unprotect()?;
        Ok(report)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Active protection of one heap
///
/// Dropping the guard unprotects the heap; use [`HeapGuard::unprotect`] to
/// see the error instead of having it logged.
pub struct HeapGuard<'a> {
    store: &'a LocalHeapStore,
    heap: HeapRef,
    addr: u64,
    mode: AccessMode,
    released: bool,
}

impl<'a> HeapGuard<'a> {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn dblk_size(&self) -> usize {
        self.heap.lock().dblk_size()
    }

    pub fn total_free(&self) -> usize {
        self.heap.lock().free_list().total_free()
    }

    pub fn report(&self) -> HeapReport {
        HeapReport::from_heap(&self.heap.lock(), self.heap.ref_count())
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode != AccessMode::ReadWrite {
            return Err(Error::InvariantViolation(format!(
                "Heap at {:#x} is protected read-only",
                self.addr
            )));
        }
        Ok(())
    }

    /// Copy `data` into the heap and return its offset
    ///
    /// The data block grows when no free block fits.
    pub fn insert(&mut self, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        if data.is_empty() {
            return Err(Error::InvariantViolation(
                "Zero-length insert".to_string(),
            ));
        }

        let need = align(data.len());
        let store = self.store;
        let mut state = self.heap.lock();
        let node = state.widths.free_node_size();
        let offset = match state.free_list.allocate(need, node) {
            Search::Placed(offset) => offset,
            Search::Exhausted { tail } => grow::grow(
                &self.heap,
                &mut state,
                need,
                tail,
                store.space.as_ref(),
                &store.cache,
            )?,
        };

        if let Err(e) = store.cache.mark_dirty(&state) {
            if let Err(undo) = state.free_list.release(offset, need, node) {
                error!(addr = self.addr, offset, error = %undo, "Failed to return space of abandoned insert");
            }
            return Err(e);
        }

        state.image[offset..offset + data.len()].copy_from_slice(data);
        state.image[offset + data.len()..offset + need].fill(0);
        debug!(addr = self.addr, offset, len = data.len(), "Inserted into local heap");
        Ok(offset)
    }

    /// Free `size` bytes at `offset`, coalescing with free neighbours
    pub fn remove(&mut self, offset: usize, size: usize) -> Result<()> {
        self.check_writable()?;
        if size == 0 || offset % HEAP_ALIGNMENT != 0 {
            return Err(Error::InvariantViolation(format!(
                "Remove of {}+{} is empty or misaligned",
                offset, size
            )));
        }

        let size = align(size);
        let store = self.store;
        let mut state = self.heap.lock();
        let dblk_size = state.dblk_size();
        if offset.checked_add(size).map_or(true, |end| end > dblk_size) {
            return Err(Error::OutOfRange(format!(
                "Remove of {}+{} past data block of {} bytes",
                offset, size, dblk_size
            )));
        }
        store.cache.mark_dirty(&state)?;

        let node = state.widths.free_node_size();
        match state.free_list.release(offset, size, node)? {
            Release::Recorded(block) => {
                if block.end() == dblk_size && 2 * block.size > dblk_size {
                    grow::shrink(&mut state, store.space.as_ref(), &store.cache);
                }
            }
            Release::Abandoned => {
                debug!(addr = self.addr, offset, size, "Freed range too small to record");
            }
        }
        debug!(addr = self.addr, offset, size, "Removed from local heap");
        Ok(())
    }

    /// Copy of the data block from `offset` to its end
    ///
    /// The heap is only locked while copying, so the bytes may be held
    /// across further calls on this guard or nested protections.
    pub fn offset_into(&self, offset: usize) -> Result<Bytes> {
        let state = self.heap.lock();
        let dblk_size = state.dblk_size();
        if offset >= dblk_size {
            return Err(Error::OutOfRange(format!(
                "Offset {} past data block of {} bytes",
                offset, dblk_size
            )));
        }
        Ok(Bytes::copy_from_slice(&state.image[offset..]))
    }

    /// Copy of `len` bytes at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let state = self.heap.lock();
        let dblk_size = state.dblk_size();
        match offset.checked_add(len) {
            Some(end) if offset < dblk_size && end <= dblk_size => Ok(state.image[offset..end].to_vec()),
            _ => Err(Error::OutOfRange(format!(
                "Read of {}+{} past data block of {} bytes",
                offset, len, dblk_size
            ))),
        }
    }

    /// End this protection, reporting unpin failures
    pub fn unprotect(mut self) -> Result<()> {
        self.released = true;
        self.store.leave(&self.heap)
    }

    /// Drop the protection of a heap whose file space was just released
    fn finish_delete(mut self) -> Result<()> {
        self.released = true;
        let mut state = self.heap.lock();
        state.deleted = true;
        state.protect_count = 0;
        self.store.cache.unpin_heap(&state)?;
        self.store.cache.evict_heap(&state)
    }
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.leave(&self.heap) {
            error!(addr = self.addr, error = %e, "Failed to unprotect heap");
        }
    }
}
