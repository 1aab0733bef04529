//! Metadata cache protocol
//!
//! A heap lives in the cache as one or two entries:
//!
//! ```text
//! Colocated (single cache object)      Split
//! ┌──────────────────────────────┐     ┌────────┐        ┌────────────┐
//! │ Prefix entry: prefix + data  │     │ Prefix │ ─ ─ ─→ │ DataBlock  │
//! └──────────────────────────────┘     └────────┘        └────────────┘
//!              │                            │                  │
//!              └──────────── LocalHeap (shared, one copy) ─────┘
//! ```
//!
//! Entries are keyed by `(kind, file address)`. The cache owns dirty, pin
//! and protect bookkeeping; entries are thin proxies over the shared heap.
//! Only [`CacheProtocolAdapter`] talks to a [`CacheManager`].

pub mod adapter;
pub mod metadata;

pub use adapter::CacheProtocolAdapter;
pub use metadata::MetadataCache;

use crate::error::Result;
use crate::heap::entry::HeapEntry;
use std::fmt;
use std::sync::Arc;

/// Kind of a cached heap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Prefix,
    DataBlock,
}

/// Cache key: entry kind plus file address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub kind: EntryKind,
    pub addr: u64,
}

impl EntryKey {
    pub fn prefix(addr: u64) -> Self {
        Self {
            kind: EntryKind::Prefix,
            addr,
        }
    }

    pub fn data_block(addr: u64) -> Self {
        Self {
            kind: EntryKind::DataBlock,
            addr,
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:#x}", self.kind, self.addr)
    }
}

/// Protection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Loader invoked by [`CacheManager::protect`] on a miss; yields the entry
/// and its on-disk image length
pub type EntryLoader<'a> = &'a mut dyn FnMut() -> Result<(HeapEntry, usize)>;

/// External metadata cache manager
pub trait CacheManager: Send + Sync {
    /// Insert a new entry of `len` image bytes; it starts dirty
    fn insert(&self, key: EntryKey, entry: HeapEntry, len: usize, pinned: bool) -> Result<()>;

    /// Look up `key`, loading it on a miss, and hold it protected until
    /// [`CacheManager::unprotect`]
    fn protect(&self, key: EntryKey, mode: AccessMode, load: EntryLoader<'_>) -> Result<Arc<HeapEntry>>;

    fn unprotect(&self, key: EntryKey, dirtied: bool) -> Result<()>;

    /// Keep an entry resident until a matching [`CacheManager::unpin`]
    fn pin(&self, key: EntryKey) -> Result<()>;

    fn unpin(&self, key: EntryKey) -> Result<()>;

    fn mark_dirty(&self, key: EntryKey) -> Result<()>;

    /// Record a new on-disk image length
    fn resize(&self, key: EntryKey, len: usize) -> Result<()>;

    /// Re-key an entry whose image moved to `new_addr`
    fn move_entry(&self, key: EntryKey, new_addr: u64) -> Result<()>;

    /// Drop an entry without writing it back (its file space is gone)
    fn evict(&self, key: EntryKey) -> Result<()>;

    /// Write every dirty entry back
    ///
    /// Locks the heaps it serializes, so callers must not hold a heap lock.
    fn flush(&self) -> Result<()>;

    fn contains(&self, key: EntryKey) -> bool;

    fn stats(&self) -> CacheStats;
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub writes: u64,
    pub size: usize,
    pub capacity: usize,
}
