//! Local heap
//!
//! A local heap stores small byte strings at stable offsets inside one
//! resizable data block, fronted by a fixed-size prefix:
//!
//! ```text
//! prefix_addr                      dblk_addr (== prefix_addr + prefix_size when colocated)
//! ┌──────┬───┬─────┬──────────┬──────────┬──────────┬─────┐┌────────────────────────────┐
//! │ HEAP │ 0 │ res │ dblk_size│ free_head│ dblk_addr│ pad ││ live bytes / free nodes ...│
//! └──────┴───┴─────┴──────────┴──────────┴──────────┴─────┘└────────────────────────────┘
//! ```
//!
//! Free ranges carry their own `(next, size)` node in their first bytes on
//! disk. In memory the free list is an ordered `Vec`; the embedded form is
//! only produced and parsed at write-back and load.

pub mod codec;
pub mod debug;
pub mod entry;
pub mod free_list;
mod grow;
pub mod local_heap;
pub mod store;

pub use codec::IntWidths;
pub use debug::HeapReport;
pub use free_list::{FreeBlock, FreeList};
pub use local_heap::{HeapLayout, LocalHeap};
pub use store::{HeapGuard, LocalHeapStore};
