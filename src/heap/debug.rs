//! Human- and machine-readable heap dumps

use super::free_list::FreeBlock;
use super::local_heap::{HeapLayout, LocalHeap};
use serde::Serialize;
use std::fmt;

const BYTES_PER_ROW: usize = 16;

/// Snapshot of one heap for inspection
#[derive(Debug, Clone, Serialize)]
pub struct HeapReport {
    pub prefix_addr: u64,
    pub prefix_size: usize,
    pub dblk_addr: u64,
    pub dblk_size: usize,
    pub layout: HeapLayout,
    pub protect_count: usize,
    pub ref_count: usize,
    pub free_blocks: Vec<FreeBlock>,
    pub total_free: usize,
    pub percent_used: f64,
    #[serde(skip)]
    data: Vec<u8>,
}

impl HeapReport {
    pub fn from_heap(heap: &LocalHeap, ref_count: usize) -> Self {
        let dblk_size = heap.dblk_size();
        let total_free = heap.free_list().total_free();
        let percent_used = if dblk_size == 0 {
            0.0
        } else {
            (dblk_size - total_free) as f64 * 100.0 / dblk_size as f64
        };

        Self {
            prefix_addr: heap.prefix_addr(),
            prefix_size: heap.prefix_size(),
            dblk_addr: heap.dblk_addr(),
            dblk_size,
            layout: heap.layout(),
            protect_count: heap.protect_count(),
            ref_count,
            free_blocks: heap.free_list().blocks().to_vec(),
            total_free,
            percent_used,
            data: heap.data().to_vec(),
        }
    }

    /// Per-byte map of the data block: true where the byte is free
    fn free_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.dblk_size];
        for block in &self.free_blocks {
            let end = block.end().min(self.dblk_size);
            for slot in mask.iter_mut().take(end).skip(block.offset) {
                *slot = true;
            }
        }
        mask
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local heap at {:#x}", self.prefix_addr)?;
        writeln!(f, "  Prefix size:      {}", self.prefix_size)?;
        writeln!(
            f,
            "  Layout:           {}",
            match self.layout {
                HeapLayout::Colocated => "colocated",
                HeapLayout::Split => "split",
            }
        )?;
        writeln!(f, "  Data block:       {:#x}, {} bytes", self.dblk_addr, self.dblk_size)?;
        writeln!(
            f,
            "  Protect/refs:     {}/{}",
            self.protect_count, self.ref_count
        )?;
        writeln!(
            f,
            "  Free:             {} bytes in {} blocks ({:.1}% used)",
            self.total_free,
            self.free_blocks.len(),
            self.percent_used
        )?;
        for (i, block) in self.free_blocks.iter().enumerate() {
            writeln!(f, "    #{:<3} offset {:>6}  size {:>6}", i, block.offset, block.size)?;
        }

        if self.data.is_empty() {
            return Ok(());
        }
        writeln!(f, "  Data:")?;
        let mask = self.free_mask();
        for (row, chunk) in self.data.chunks(BYTES_PER_ROW).enumerate() {
            let base = row * BYTES_PER_ROW;
            write!(f, "    {:06x}: ", base)?;
            for col in 0..BYTES_PER_ROW {
                match chunk.get(col) {
                    Some(_) if mask[base + col] => write!(f, "__ ")?,
                    Some(b) => write!(f, "{:02x} ", b)?,
                    None => write!(f, "   ")?,
                }
            }
            write!(f, " |")?;
            for (col, &b) in chunk.iter().enumerate() {
                let c = if mask[base + col] {
                    ' '
                } else if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                };
                write!(f, "{}", c)?;
            }
            writeln!(f, "|")?;
        }
        Ok(())
    }
}
