//! The local heap aggregate
//!
//! One `LocalHeap` is shared by its cache proxies and by every guard that
//! protects it. All state lives here; proxies and guards only hold an
//! [`HeapRef`].

use super::codec::{self, HeapPrefix, IntWidths, FREE_NULL};
use super::free_list::{FreeBlock, FreeList};
use crate::error::{Error, Result};
use crate::file::BlockIo;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Whether the prefix and data block form one cached region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapLayout {
    /// Data block directly follows the prefix; one cache entry
    Colocated,
    /// Data block lives elsewhere; prefix and data block are separate entries
    Split,
}

#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub(crate) widths: IntWidths,
    pub(crate) prefix_addr: u64,
    pub(crate) dblk_addr: u64,
    /// In-memory mirror of the data block; its length is the data block size
    pub(crate) image: Vec<u8>,
    pub(crate) free_list: FreeList,
    pub(crate) protect_count: usize,
    pub(crate) layout: HeapLayout,
    /// Set once the heap's file space has been released
    pub(crate) deleted: bool,
}

impl LocalHeap {
    /// Fresh heap whose data block directly follows the prefix at `prefix_addr`
    ///
    /// `dblk_size` must already be aligned and either zero or at least one
    /// free node.
    pub fn new(widths: IntWidths, prefix_addr: u64, dblk_size: usize) -> Self {
        let free_list = if dblk_size > 0 {
            FreeList::from_blocks(vec![FreeBlock::new(0, dblk_size)])
        } else {
            FreeList::new()
        };

        Self {
            widths,
            prefix_addr,
            dblk_addr: prefix_addr + widths.prefix_size() as u64,
            image: vec![0u8; dblk_size],
            free_list,
            protect_count: 0,
            layout: HeapLayout::Colocated,
            deleted: false,
        }
    }

    /// Read a heap back from the device
    ///
    /// One speculative read of `speculative_len` bytes usually covers a
    /// colocated heap entirely; otherwise the data block is fetched with a
    /// second, targeted read.
    pub fn load(io: &dyn BlockIo, widths: IntWidths, addr: u64, speculative_len: usize) -> Result<Self> {
        let prefix_size = widths.prefix_size();
        if addr >= io.len() {
            return Err(Error::NotFound(format!(
                "No heap at {:#x}: device ends at {:#x}",
                addr,
                io.len()
            )));
        }

        let first = io.read_at(addr, speculative_len.max(prefix_size))?;
        let prefix = HeapPrefix::decode(&widths, &first)?;
        // the data block has to lie inside the device
        let dblk_end = prefix.dblk_addr.checked_add(prefix.dblk_size);
        if prefix.dblk_size > widths.max_length() || dblk_end.map_or(true, |end| end > io.len()) {
            return Err(Error::CorruptFormat(format!(
                "Data block {:#x}+{} runs past the device end {:#x}",
                prefix.dblk_addr,
                prefix.dblk_size,
                io.len()
            )));
        }
        let dblk_size = usize::try_from(prefix.dblk_size).map_err(|_| {
            Error::CorruptFormat(format!("Data block size {} too large", prefix.dblk_size))
        })?;
        let colocated_end = prefix_size.checked_add(dblk_size).ok_or_else(|| {
            Error::CorruptFormat(format!("Data block size {} too large", dblk_size))
        })?;

        let layout = if prefix.dblk_addr == addr + prefix_size as u64 {
            HeapLayout::Colocated
        } else {
            HeapLayout::Split
        };

        let image = if dblk_size == 0 {
            Vec::new()
        } else if layout == HeapLayout::Colocated && first.len() >= colocated_end {
            first[prefix_size..colocated_end].to_vec()
        } else {
            let data = io.read_at(prefix.dblk_addr, dblk_size)?;
            if data.len() < dblk_size {
                return Err(Error::CorruptFormat(format!(
                    "Data block at {:#x} truncated: {} of {} bytes",
                    prefix.dblk_addr,
                    data.len(),
                    dblk_size
                )));
            }
            data.to_vec()
        };

        let blocks = codec::decode_free_list(&widths, &image, prefix.free_list_head)?;
        debug!(
            addr,
            dblk_addr = prefix.dblk_addr,
            dblk_size,
            free_blocks = blocks.len(),
            ?layout,
            "Loaded local heap"
        );

        Ok(Self {
            widths,
            prefix_addr: addr,
            dblk_addr: prefix.dblk_addr,
            image,
            free_list: FreeList::from_blocks(blocks),
            protect_count: 0,
            layout,
            deleted: false,
        })
    }

    pub fn widths(&self) -> &IntWidths {
        &self.widths
    }

    pub fn prefix_addr(&self) -> u64 {
        self.prefix_addr
    }

    pub fn prefix_size(&self) -> usize {
        self.widths.prefix_size()
    }

    pub fn dblk_addr(&self) -> u64 {
        self.dblk_addr
    }

    pub fn dblk_size(&self) -> usize {
        self.image.len()
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn protect_count(&self) -> usize {
        self.protect_count
    }

    pub fn layout(&self) -> HeapLayout {
        self.layout
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_single_cache_object(&self) -> bool {
        self.layout == HeapLayout::Colocated
    }

    pub fn data(&self) -> &[u8] {
        &self.image
    }

    /// Persisted free-list head (offset or [`FREE_NULL`])
    pub fn free_list_head(&self) -> u64 {
        self.free_list.head_offset()
    }

    fn prefix(&self) -> HeapPrefix {
        HeapPrefix {
            dblk_size: self.dblk_size() as u64,
            free_list_head: self.free_list_head(),
            dblk_addr: self.dblk_addr,
        }
    }

    /// Data block image with the free list embedded
    fn encode_data(&self) -> Result<Vec<u8>> {
        let mut image = self.image.clone();
        codec::encode_free_list(&self.widths, &mut image, self.free_list.blocks())?;
        Ok(image)
    }

    /// Image of the prefix entry: the prefix, followed by the data block
    /// when colocated
    pub fn serialize_prefix(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.prefix_image_len());
        self.prefix().encode(&self.widths, &mut out)?;
        if self.layout == HeapLayout::Colocated {
            out.extend_from_slice(&self.encode_data()?);
        }
        Ok(out.freeze())
    }

    /// Image of the separate data block entry
    pub fn serialize_data_block(&self) -> Result<Bytes> {
        Ok(Bytes::from(self.encode_data()?))
    }

    pub fn prefix_image_len(&self) -> usize {
        match self.layout {
            HeapLayout::Colocated => self.prefix_size() + self.dblk_size(),
            HeapLayout::Split => self.prefix_size(),
        }
    }

    /// Total file bytes taken by the heap
    pub fn storage_size(&self) -> usize {
        self.prefix_size() + self.dblk_size()
    }
}

/// Shared root of one heap: the locked state plus the count of live proxies
#[derive(Debug)]
pub struct SharedHeap {
    state: Mutex<LocalHeap>,
    refs: AtomicUsize,
}

pub type HeapRef = Arc<SharedHeap>;

impl SharedHeap {
    pub fn new(heap: LocalHeap) -> HeapRef {
        Arc::new(Self {
            state: Mutex::new(heap),
            refs: AtomicUsize::new(0),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, LocalHeap> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, LocalHeap>> {
        self.state.try_lock()
    }

    /// Number of live cache proxies
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when the last proxy went away
    pub(crate) fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}
