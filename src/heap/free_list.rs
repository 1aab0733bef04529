//! Free list of a local heap
//!
//! Free ranges are kept as an ordered list of `(offset, size)` records, head
//! first. The order is the persisted order: the head becomes the prefix's
//! `free_list_head` and every node links to its successor. The embedded
//! on-disk form is only produced by the codec at flush time.
//!
//! Policies:
//! - **search**: the first block that either matches exactly or leaves at
//!   least one free node's worth of spare bytes wins (not first-fit, not
//!   best-fit).
//! - **release**: coalesce with at most one neighbour on each side; tiny
//!   isolated ranges are abandoned; new nodes go to the head.
//! - **minimize**: plan how far the data block can shrink behind a large
//!   trailing free block.

use super::codec::{align, FREE_NULL, MIN_HEAP_SIZE};
use crate::error::{Error, Result};
use serde::Serialize;

/// A free range inside the data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FreeBlock {
    pub offset: usize,
    pub size: usize,
}

impl FreeBlock {
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// First byte past this block
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Outcome of a free-list search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    /// Space was carved out at this offset
    Placed(usize),
    /// Nothing fits; `tail` is the index of the block with the greatest offset
    Exhausted { tail: Option<usize> },
}

/// Outcome of releasing a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Merged into (or inserted as) this block
    Recorded(FreeBlock),
    /// Too small to describe itself and touching no free block
    Abandoned,
}

/// How the data block shrinks behind its trailing free block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimizePlan {
    /// Data block size after shrinking
    pub new_size: usize,
    /// Index of the trailing block
    pub index: usize,
    /// New size of the trailing block; `None` drops it from the list
    pub block_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from blocks already in list order (e.g. decoded from disk)
    pub fn from_blocks(blocks: Vec<FreeBlock>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Persisted head offset, [`FREE_NULL`] when empty
    pub fn head_offset(&self) -> u64 {
        self.blocks.first().map_or(FREE_NULL, |b| b.offset as u64)
    }

    pub fn total_free(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    pub(crate) fn get(&self, index: usize) -> Option<FreeBlock> {
        self.blocks.get(index).copied()
    }

    pub(crate) fn set(&mut self, index: usize, block: FreeBlock) {
        self.blocks[index] = block;
    }

    pub(crate) fn remove(&mut self, index: usize) -> FreeBlock {
        self.blocks.remove(index)
    }

    pub(crate) fn push_front(&mut self, block: FreeBlock) {
        self.blocks.insert(0, block);
    }

    /// Carve `need` (already aligned) bytes out of the list
    pub fn allocate(&mut self, need: usize, node_size: usize) -> Search {
        let mut tail: Option<usize> = None;

        for i in 0..self.blocks.len() {
            let block = self.blocks[i];
            if block.size > need && block.size - need >= node_size {
                self.blocks[i] = FreeBlock::new(block.offset + need, block.size - need);
                return Search::Placed(block.offset);
            } else if block.size == need {
                self.blocks.remove(i);
                return Search::Placed(block.offset);
            } else if tail.map_or(true, |t| self.blocks[t].offset < block.offset) {
                tail = Some(i);
            }
        }

        Search::Exhausted { tail }
    }

    /// Return `[offset, offset + size)` to the list, coalescing with neighbours
    ///
    /// `size` must already be aligned. Overlapping an existing free block is a
    /// double free and is refused without touching the list.
    pub fn release(&mut self, offset: usize, size: usize, node_size: usize) -> Result<Release> {
        let end = offset + size;
        if let Some(hit) = self
            .blocks
            .iter()
            .find(|b| b.offset < end && offset < b.end())
        {
            return Err(Error::InvariantViolation(format!(
                "Range {}+{} overlaps free block {}+{}",
                offset, size, hit.offset, hit.size
            )));
        }

        for i in 0..self.blocks.len() {
            let block = self.blocks[i];

            if end == block.offset {
                // freed range sits right before this block
                let mut merged = FreeBlock::new(offset, block.size + size);
                if let Some(j) = (i + 1..self.blocks.len()).find(|&j| self.blocks[j].end() == merged.offset) {
                    let left = self.blocks[j];
                    merged = FreeBlock::new(left.offset, merged.size + left.size);
                    self.blocks.remove(j);
                }
                self.blocks[i] = merged;
                return Ok(Release::Recorded(merged));
            } else if block.end() == offset {
                // freed range sits right after this block
                let mut merged = FreeBlock::new(block.offset, block.size + size);
                if let Some(j) = (i + 1..self.blocks.len()).find(|&j| self.blocks[j].offset == merged.end()) {
                    merged.size += self.blocks[j].size;
                    self.blocks.remove(j);
                }
                self.blocks[i] = merged;
                return Ok(Release::Recorded(merged));
            }
        }

        if size < node_size {
            return Ok(Release::Abandoned);
        }

        let block = FreeBlock::new(offset, size);
        self.push_front(block);
        Ok(Release::Recorded(block))
    }

    /// Index of the block ending exactly at `dblk_size`
    pub fn tail_block(&self, dblk_size: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.end() == dblk_size)
    }

    /// Work out whether, and how far, the data block can shrink
    pub fn plan_minimize(&self, dblk_size: usize, node_size: usize) -> Option<MinimizePlan> {
        let index = self.tail_block(dblk_size)?;
        let block = self.blocks[index];
        if block.size < dblk_size / 2 || dblk_size <= MIN_HEAP_SIZE {
            return None;
        }

        let floor = block.offset + node_size;
        let mut new_size = dblk_size;
        while new_size > MIN_HEAP_SIZE && new_size >= floor {
            new_size /= 2;
        }

        let (new_size, block_size) = if new_size < floor {
            if self.blocks.len() == 1 {
                // keep the only block, one halving step less
                let size = align(new_size * 2);
                (size, Some(size - block.offset))
            } else {
                (block.offset, None)
            }
        } else {
            let size = align(new_size);
            (size, Some(size - block.offset))
        };

        if new_size >= dblk_size {
            return None;
        }

        Some(MinimizePlan {
            new_size,
            index,
            block_size,
        })
    }

    pub fn apply_minimize(&mut self, plan: &MinimizePlan) {
        match plan.block_size {
            Some(size) => self.blocks[plan.index].size = size,
            None => {
                self.blocks.remove(plan.index);
            }
        }
    }

    /// True when some pair of blocks touches
    pub fn has_adjacent_blocks(&self) -> bool {
        let mut sorted = self.blocks.clone();
        sorted.sort_by_key(|b| b.offset);
        sorted.windows(2).any(|w| w[0].end() == w[1].offset)
    }
}
