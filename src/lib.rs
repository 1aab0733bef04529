// localheap - persistent local heap for structured binary files
// Variable-length byte blobs stored at stable offsets inside a resizable data block

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod file;
pub mod heap;

// Re-exports for convenience
pub use cache::{AccessMode, CacheManager, EntryKey, EntryKind, MetadataCache};
pub use crate::config::{ByteOrder, HeapConfig};
pub use file::{BlockIo, ExtentAllocator, FileBlockIo, FileSpace, MemBlockIo};
pub use heap::{HeapGuard, HeapReport, IntWidths, LocalHeapStore};

/// Local heap error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Bad magic, unknown version or an unreadable free list
        #[error("Corrupt heap format: {0}")]
        CorruptFormat(String),

        /// Offset or size outside the data block
        #[error("Out of range: {0}")]
        OutOfRange(String),

        /// File space could not be reserved, extended or released
        #[error("Allocation error: {0}")]
        Allocation(String),

        /// Protect/pin/resize failures surfaced from the metadata cache
        #[error("Cache protocol error: {0}")]
        CacheProtocol(String),

        /// Caller broke a precondition (misaligned remove, write through a read-only guard)
        #[error("Invariant violation: {0}")]
        InvariantViolation(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
