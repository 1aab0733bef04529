//! LRU metadata cache for heap entries
//!
//! Entries stay resident while pinned or protected. Everything else is kept
//! in recency order and evicted least-recently-used first once the cache
//! holds more than `capacity` entries; dirty entries are written back through
//! the [`BlockIo`] before they go.

use super::{AccessMode, CacheManager, CacheStats, EntryKey, EntryLoader};
use crate::error::{Error, Result};
use crate::file::BlockIo;
use crate::heap::entry::HeapEntry;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct Slot {
    entry: Arc<HeapEntry>,
    /// On-disk image length, as last announced by insert/resize
    len: usize,
    dirty: bool,
    pins: usize,
    protects: usize,
    write_protected: bool,
}

impl Slot {
    fn new(entry: Arc<HeapEntry>, len: usize) -> Self {
        Self {
            entry,
            len,
            dirty: false,
            pins: 0,
            protects: 0,
            write_protected: false,
        }
    }

    fn is_resident(&self) -> bool {
        self.pins > 0 || self.protects > 0 || !self.entry.is_evictable()
    }
}

struct CacheState {
    slots: HashMap<EntryKey, Slot>,
    /// Recency order over every key in `slots`
    recency: LruCache<EntryKey, ()>,
    hits: u64,
    misses: u64,
    evictions: u64,
    writes: u64,
}

impl CacheState {
    fn slot_mut(&mut self, key: EntryKey) -> Result<&mut Slot> {
        self.slots
            .get_mut(&key)
            .ok_or_else(|| Error::CacheProtocol(format!("Entry {} not in cache", key)))
    }
}

/// Metadata cache over a block device
pub struct MetadataCache {
    io: Arc<dyn BlockIo>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl MetadataCache {
    /// Create a cache holding up to `capacity` unpinned entries
    pub fn new(io: Arc<dyn BlockIo>, capacity: usize) -> Self {
        Self {
            io,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                recency: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
                writes: 0,
            }),
        }
    }

    /// Whether `key` is cached and dirty
    pub fn is_dirty(&self, key: EntryKey) -> bool {
        self.state.lock().slots.get(&key).map_or(false, |s| s.dirty)
    }

    /// Pin count of `key` (0 when absent)
    pub fn pin_count(&self, key: EntryKey) -> usize {
        self.state.lock().slots.get(&key).map_or(0, |s| s.pins)
    }

    /// Recorded image length of `key`
    pub fn entry_len(&self, key: EntryKey) -> Option<usize> {
        self.state.lock().slots.get(&key).map(|s| s.len)
    }

    fn write_back(&self, key: EntryKey, len: usize, image: Bytes, addr: u64) -> Result<()> {
        if image.len() != len {
            return Err(Error::CacheProtocol(format!(
                "Entry {} serialized to {} bytes, expected {}",
                key,
                image.len(),
                len
            )));
        }
        self.io.write_at(addr, &image)?;
        trace!(%key, addr, len, "Wrote cache entry back");
        Ok(())
    }

    /// Evict least-recently-used entries until the cache fits its capacity
    ///
    /// Pinned, protected and busy entries are skipped.
    fn shrink_to_capacity(&self, state: &mut CacheState) -> Result<()> {
        if state.slots.len() <= self.capacity {
            return Ok(());
        }

        let candidates: Vec<EntryKey> = state.recency.iter().rev().map(|(k, _)| *k).collect();
        for key in candidates {
            if state.slots.len() <= self.capacity {
                break;
            }
            let Some(slot) = state.slots.get(&key) else {
                continue;
            };
            if slot.is_resident() {
                continue;
            }

            if slot.dirty {
                match slot.entry.try_serialize() {
                    None => continue,
                    Some(Ok(Some((addr, image)))) => {
                        self.write_back(key, slot.len, image, addr)?;
                        state.writes += 1;
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => return Err(e),
                }
            }

            state.slots.remove(&key);
            state.recency.pop(&key);
            state.evictions += 1;
            metrics::counter!("localheap_cache_evictions_total").increment(1);
            debug!(%key, "Evicted cache entry");
        }

        Ok(())
    }
}

impl CacheManager for MetadataCache {
    fn insert(&self, key: EntryKey, entry: HeapEntry, len: usize, pinned: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.slots.contains_key(&key) {
            return Err(Error::CacheProtocol(format!("Entry {} already cached", key)));
        }

        let mut slot = Slot::new(Arc::new(entry), len);
        slot.dirty = true;
        if pinned {
            slot.pins = 1;
        }
        state.slots.insert(key, slot);
        state.recency.put(key, ());
        debug!(%key, len, pinned, "Inserted cache entry");

        self.shrink_to_capacity(&mut state)
    }

    fn protect(&self, key: EntryKey, mode: AccessMode, load: EntryLoader<'_>) -> Result<Arc<HeapEntry>> {
        let mut state = self.state.lock();

        if let Some(slot) = state.slots.get_mut(&key) {
            if slot.write_protected || (mode == AccessMode::ReadWrite && slot.protects > 0) {
                return Err(Error::CacheProtocol(format!(
                    "Entry {} already protected",
                    key
                )));
            }
            slot.protects += 1;
            slot.write_protected = mode == AccessMode::ReadWrite;
            let entry = slot.entry.clone();
            state.recency.promote(&key);
            state.hits += 1;
            metrics::counter!("localheap_cache_hits_total").increment(1);
            return Ok(entry);
        }

        state.misses += 1;
        metrics::counter!("localheap_cache_misses_total").increment(1);
        let (entry, len) = load()?;
        if entry.kind() != key.kind {
            return Err(Error::CacheProtocol(format!(
                "Loader for {} produced a {:?} entry",
                key,
                entry.kind()
            )));
        }

        let entry = Arc::new(entry);
        let mut slot = Slot::new(entry.clone(), len);
        slot.protects = 1;
        slot.write_protected = mode == AccessMode::ReadWrite;
        state.slots.insert(key, slot);
        state.recency.put(key, ());
        debug!(%key, len, "Loaded cache entry");

        self.shrink_to_capacity(&mut state)?;
        Ok(entry)
    }

    fn unprotect(&self, key: EntryKey, dirtied: bool) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(key)?;
        if slot.protects == 0 {
            return Err(Error::CacheProtocol(format!("Entry {} not protected", key)));
        }
        slot.protects -= 1;
        if slot.protects == 0 {
            slot.write_protected = false;
        }
        slot.dirty |= dirtied;

        self.shrink_to_capacity(&mut state)
    }

    fn pin(&self, key: EntryKey) -> Result<()> {
        let mut state = self.state.lock();
        state.slot_mut(key)?.pins += 1;
        Ok(())
    }

    fn unpin(&self, key: EntryKey) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(key)?;
        if slot.pins == 0 {
            return Err(Error::CacheProtocol(format!("Entry {} not pinned", key)));
        }
        slot.pins -= 1;

        self.shrink_to_capacity(&mut state)
    }

    fn mark_dirty(&self, key: EntryKey) -> Result<()> {
        let mut state = self.state.lock();
        state.slot_mut(key)?.dirty = true;
        Ok(())
    }

    fn resize(&self, key: EntryKey, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(key)?;
        slot.len = len;
        slot.dirty = true;
        Ok(())
    }

    fn move_entry(&self, key: EntryKey, new_addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        let new_key = EntryKey {
            kind: key.kind,
            addr: new_addr,
        };
        if state.slots.contains_key(&new_key) {
            return Err(Error::CacheProtocol(format!(
                "Cannot move {} onto cached entry {}",
                key, new_key
            )));
        }

        let mut slot = state
            .slots
            .remove(&key)
            .ok_or_else(|| Error::CacheProtocol(format!("Entry {} not in cache", key)))?;
        slot.dirty = true;
        state.slots.insert(new_key, slot);
        state.recency.pop(&key);
        state.recency.put(new_key, ());
        debug!(from = %key, to = %new_key, "Moved cache entry");
        Ok(())
    }

    fn evict(&self, key: EntryKey) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(key)?;
        if slot.pins > 0 || slot.protects > 0 {
            return Err(Error::CacheProtocol(format!(
                "Cannot evict {}: pinned or protected",
                key
            )));
        }

        state.slots.remove(&key);
        state.recency.pop(&key);
        debug!(%key, "Dropped cache entry without write-back");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Collect under the cache lock, serialize without it: a heap lock
        // holder may be waiting on the cache.
        let dirty: Vec<(EntryKey, Arc<HeapEntry>)> = {
            let mut state = self.state.lock();
            state
                .slots
                .iter_mut()
                .filter(|(_, slot)| slot.dirty)
                .map(|(key, slot)| {
                    slot.dirty = false;
                    (*key, slot.entry.clone())
                })
                .collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }

        let mut images = Vec::with_capacity(dirty.len());
        for (key, entry) in &dirty {
            match entry.serialize() {
                Ok(image) => images.push((*key, entry.clone(), image)),
                Err(e) => {
                    self.restore_dirty(dirty.iter().map(|(k, _)| *k));
                    return Err(e);
                }
            }
        }

        let mut state = self.state.lock();
        let mut written = 0usize;
        for (i, (key, entry, image)) in images.into_iter().enumerate() {
            let Some((addr, image)) = image else {
                continue;
            };
            // Moved or evicted since the snapshot; the new key carries the write
            let Some(slot) = state.slots.get(&key) else {
                continue;
            };
            if !Arc::ptr_eq(&slot.entry, &entry) {
                continue;
            }

            if let Err(e) = self.write_back(key, slot.len, image, addr) {
                for (k, _) in &dirty[i..] {
                    if let Some(slot) = state.slots.get_mut(k) {
                        slot.dirty = true;
                    }
                }
                return Err(e);
            }
            state.writes += 1;
            written += 1;
        }
        drop(state);

        self.io.sync()?;
        debug!(written, "Flushed metadata cache");
        Ok(())
    }

    fn contains(&self, key: EntryKey) -> bool {
        self.state.lock().slots.contains_key(&key)
    }

    fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let total = state.hits + state.misses;
        let hit_rate = if total > 0 {
            state.hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            evictions: state.evictions,
            writes: state.writes,
            size: state.slots.len(),
            capacity: self.capacity,
        }
    }
}

impl MetadataCache {
    fn restore_dirty(&self, keys: impl Iterator<Item = EntryKey>) {
        let mut state = self.state.lock();
        for key in keys {
            match state.slots.get_mut(&key) {
                Some(slot) => slot.dirty = true,
                None => warn!(%key, "Dirty entry vanished during flush"),
            }
        }
    }
}
