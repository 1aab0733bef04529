//! File collaborators
//!
//! The heap never touches a file directly. It reads and writes raw bytes
//! through [`BlockIo`] and reserves, grows and releases byte ranges through
//! [`FileSpace`].
//!
//! ```text
//! LocalHeapStore
//!   ├─→ FileSpace  (allocate / try_extend / free)   → ExtentAllocator
//!   └─→ BlockIo    (read_at / write_at)             → MemBlockIo | FileBlockIo
//!         ↑
//!   MetadataCache write-back
//! ```

pub mod io;
pub mod space;

pub use io::{FileBlockIo, MemBlockIo};
pub use space::ExtentAllocator;

use crate::error::Result;
use bytes::Bytes;

/// Raw positioned block I/O
pub trait BlockIo: Send + Sync {
    /// Read up to `len` bytes at `addr`
    ///
    /// Returns fewer bytes only when the read runs past the end of the device.
    fn read_at(&self, addr: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `addr`, growing the device if needed
    fn write_at(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Current device length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make written data durable
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-space allocator handing out byte extents
pub trait FileSpace: Send + Sync {
    /// Reserve `len` contiguous bytes and return their address
    fn allocate(&self, len: u64) -> Result<u64>;

    /// Grow the extent `[addr, addr + len)` in place by `extra` bytes
    ///
    /// `Ok(false)` means the neighbouring space is taken; the caller has to
    /// relocate.
    fn try_extend(&self, addr: u64, len: u64, extra: u64) -> Result<bool>;

    /// Release `[addr, addr + len)`
    fn free(&self, addr: u64, len: u64) -> Result<()>;
}
