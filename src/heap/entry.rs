//! Cache proxies for a local heap
//!
//! Both proxies point at the same [`SharedHeap`]. Creating one bumps the
//! heap's proxy count and dropping it lowers the count again, so the heap
//! root lives exactly as long as something still refers to it.

use super::local_heap::{HeapLayout, HeapRef, LocalHeap};
use crate::cache::EntryKind;
use crate::error::Result;
use bytes::Bytes;
use std::fmt;
use tracing::trace;

/// Prefix proxy; serializes the prefix, plus the data block when colocated
pub struct PrefixEntry {
    heap: HeapRef,
}

/// Data block proxy of a split heap
pub struct DataBlockEntry {
    heap: HeapRef,
}

impl PrefixEntry {
    fn new(heap: HeapRef) -> Self {
        heap.acquire();
        Self { heap }
    }
}

impl DataBlockEntry {
    fn new(heap: HeapRef) -> Self {
        heap.acquire();
        Self { heap }
    }
}

impl Drop for PrefixEntry {
    fn drop(&mut self) {
        if self.heap.release() {
            trace!("Last proxy of a local heap released");
        }
    }
}

impl Drop for DataBlockEntry {
    fn drop(&mut self) {
        if self.heap.release() {
            trace!("Last proxy of a local heap released");
        }
    }
}

/// Cache object for one part of a local heap
pub enum HeapEntry {
    Prefix(PrefixEntry),
    DataBlock(DataBlockEntry),
}

impl HeapEntry {
    pub fn prefix(heap: HeapRef) -> Self {
        HeapEntry::Prefix(PrefixEntry::new(heap))
    }

    pub fn data_block(heap: HeapRef) -> Self {
        HeapEntry::DataBlock(DataBlockEntry::new(heap))
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            HeapEntry::Prefix(_) => EntryKind::Prefix,
            HeapEntry::DataBlock(_) => EntryKind::DataBlock,
        }
    }

    pub fn heap(&self) -> &HeapRef {
        match self {
            HeapEntry::Prefix(p) => &p.heap,
            HeapEntry::DataBlock(d) => &d.heap,
        }
    }

    /// Serialize the current heap state for write-back
    ///
    /// Returns the address the image belongs at. `None` means the entry no
    /// longer describes live file space (its data block moved or the heap
    /// was deleted).
    pub fn serialize(&self) -> Result<Option<(u64, Bytes)>> {
        let heap = self.heap().lock();
        Self::serialize_locked(self.kind(), &heap)
    }

    /// Like [`HeapEntry::serialize`], but gives up when the heap is busy
    pub fn try_serialize(&self) -> Option<Result<Option<(u64, Bytes)>>> {
        let heap = self.heap().try_lock()?;
        Some(Self::serialize_locked(self.kind(), &heap))
    }

    fn serialize_locked(kind: EntryKind, heap: &LocalHeap) -> Result<Option<(u64, Bytes)>> {
        if heap.is_deleted() {
            return Ok(None);
        }
        match kind {
            EntryKind::Prefix => Ok(Some((heap.prefix_addr(), heap.serialize_prefix()?))),
            EntryKind::DataBlock if heap.layout() == HeapLayout::Split => {
                Ok(Some((heap.dblk_addr(), heap.serialize_data_block()?)))
            }
            EntryKind::DataBlock => Ok(None),
        }
    }

    /// A prefix must outlive its data block entry; it may only go once it is
    /// the heap's last proxy
    pub fn is_evictable(&self) -> bool {
        match self {
            HeapEntry::Prefix(p) => p.heap.ref_count() <= 1,
            HeapEntry::DataBlock(_) => true,
        }
    }
}

impl fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapEntry")
            .field("kind", &self.kind())
            .field("refs", &self.heap().ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteOrder;
    use crate::heap::codec::IntWidths;
    use crate::heap::local_heap::{LocalHeap, SharedHeap};

    fn shared(dblk_size: usize) -> HeapRef {
        let widths = IntWidths::new(8, 8, ByteOrder::Little).unwrap();
        SharedHeap::new(LocalHeap::new(widths, 0, dblk_size))
    }

    #[test]
    fn test_proxies_track_ref_count() {
        let heap = shared(64);
        let prefix = HeapEntry::prefix(heap.clone());
        assert_eq!(heap.ref_count(), 1);
        assert!(prefix.is_evictable());

        let dblk = HeapEntry::data_block(heap.clone());
        assert_eq!(heap.ref_count(), 2);
        assert!(!prefix.is_evictable());
        assert!(dblk.is_evictable());

        drop(dblk);
        assert_eq!(heap.ref_count(), 1);
        assert!(prefix.is_evictable());
        drop(prefix);
        assert_eq!(heap.ref_count(), 0);
    }

    #[test]
    fn test_serialize_follows_layout() -> Result<()> {
        let heap = shared(64);
        let prefix = HeapEntry::prefix(heap.clone());
        assert_eq!(prefix.kind(), EntryKind::Prefix);
        let (addr, image) = prefix.serialize()?.unwrap();
        assert_eq!((addr, image.len()), (0, 96));

        // a colocated heap has no separate data block image
        let dblk = HeapEntry::data_block(heap.clone());
        assert!(dblk.serialize()?.is_none());

        {
            let mut state = heap.lock();
            state.layout = HeapLayout::Split;
            state.dblk_addr = 256;
        }
        assert_eq!(prefix.serialize()?.unwrap().1.len(), 32);
        let (addr, image) = dblk.serialize()?.unwrap();
        assert_eq!((addr, image.len()), (256, 64));
        Ok(())
    }

    #[test]
    fn test_try_serialize_skips_busy_heap() {
        let heap = shared(64);
        let prefix = HeapEntry::prefix(heap.clone());
        let _held = heap.lock();
        assert!(prefix.try_serialize().is_none());
    }
}
