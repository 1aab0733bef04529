//! Disk layout codec
//!
//! Bit-exact encoding of the heap prefix and of the free-list nodes embedded
//! in freed bytes of the data block.
//!
//! ```text
//! Prefix (padded to an 8-byte multiple):
//! +-------+---------+----------+-----------+----------------+-----------+
//! | HEAP  | version | reserved | dblk_size | free_list_head | dblk_addr |
//! | 4 B   | 1 B     | 3 B      | L bytes   | L bytes        | A bytes   |
//! +-------+---------+----------+-----------+----------------+-----------+
//!
//! Free node (first bytes of every free block):
//! +-------------+-----------+
//! | next_offset | size      |
//! | L bytes     | L bytes   |
//! +-------------+-----------+
//! ```
//!
//! `L` is the file's length width and `A` its address width. An empty list
//! (and the last node's `next_offset`) is encoded as [`FREE_NULL`].

use super::free_list::FreeBlock;
use crate::config::ByteOrder;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Prefix signature
pub const HEAP_MAGIC: &[u8; 4] = b"HEAP";
/// Only known prefix version
pub const HEAP_VERSION: u8 = 0;
/// Alignment of the data block size and of every heap offset
pub const HEAP_ALIGNMENT: usize = 8;
/// End-of-list marker; never a valid (aligned) offset
pub const FREE_NULL: u64 = 1;
/// Data blocks at or below this size are never shrunk
pub const MIN_HEAP_SIZE: usize = 128;
/// Default number of bytes read when loading a prefix
pub const SPECULATIVE_READ_SIZE: usize = 512;

const MAGIC_LEN: usize = 4;
const RESERVED_LEN: usize = 3;

/// Round `n` up to the heap alignment
pub fn align(n: usize) -> usize {
    n.div_ceil(HEAP_ALIGNMENT) * HEAP_ALIGNMENT
}

/// Integer widths and byte order of the containing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntWidths {
    sizeof_size: u8,
    sizeof_addr: u8,
    order: ByteOrder,
}

impl IntWidths {
    pub fn new(sizeof_size: u8, sizeof_addr: u8, order: ByteOrder) -> Result<Self> {
        for width in [sizeof_size, sizeof_addr] {
            if !matches!(width, 2 | 4 | 8) {
                return Err(Error::Config(format!(
                    "Unsupported integer width {} (expected 2, 4 or 8)",
                    width
                )));
            }
        }
        Ok(Self {
            sizeof_size,
            sizeof_addr,
            order,
        })
    }

    pub fn sizeof_size(&self) -> usize {
        self.sizeof_size as usize
    }

    pub fn sizeof_addr(&self) -> usize {
        self.sizeof_addr as usize
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Bytes taken by one embedded free-list node; the smallest free block
    pub fn free_node_size(&self) -> usize {
        align(2 * self.sizeof_size())
    }

    /// Encoded prefix size, including alignment padding
    pub fn prefix_size(&self) -> usize {
        align(MAGIC_LEN + 1 + RESERVED_LEN + 2 * self.sizeof_size() + self.sizeof_addr())
    }

    /// Largest length encodable in `sizeof_size` bytes
    pub fn max_length(&self) -> u64 {
        max_for_width(self.sizeof_size())
    }

    /// Largest address encodable in `sizeof_addr` bytes
    pub fn max_addr(&self) -> u64 {
        max_for_width(self.sizeof_addr())
    }

    /// Whether every byte of `[addr, addr + len)` has an encodable address
    pub fn fits_extent(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(_) if len == 0 => addr <= self.max_addr(),
            Some(end) => end - 1 <= self.max_addr(),
            None => false,
        }
    }

    fn put(&self, buf: &mut impl BufMut, value: u64, width: usize, what: &str) -> Result<()> {
        if value > max_for_width(width) {
            return Err(Error::OutOfRange(format!(
                "{} {} does not fit in {} bytes",
                what, value, width
            )));
        }
        match self.order {
            ByteOrder::Little => buf.put_uint_le(value, width),
            ByteOrder::Big => buf.put_uint(value, width),
        }
        Ok(())
    }

    fn get(&self, buf: &mut impl Buf, width: usize) -> u64 {
        match self.order {
            ByteOrder::Little => buf.get_uint_le(width),
            ByteOrder::Big => buf.get_uint(width),
        }
    }

    pub fn put_length(&self, buf: &mut impl BufMut, value: u64) -> Result<()> {
        self.put(buf, value, self.sizeof_size(), "length")
    }

    pub fn put_addr(&self, buf: &mut impl BufMut, value: u64) -> Result<()> {
        self.put(buf, value, self.sizeof_addr(), "address")
    }

    pub fn get_length(&self, buf: &mut impl Buf) -> u64 {
        self.get(buf, self.sizeof_size())
    }

    pub fn get_addr(&self, buf: &mut impl Buf) -> u64 {
        self.get(buf, self.sizeof_addr())
    }
}

fn max_for_width(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Decoded heap prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPrefix {
    pub dblk_size: u64,
    /// Offset of the first free block, or [`FREE_NULL`]
    pub free_list_head: u64,
    pub dblk_addr: u64,
}

impl HeapPrefix {
    /// Append the encoded prefix (exactly `prefix_size` bytes) to `out`
    pub fn encode(&self, widths: &IntWidths, out: &mut BytesMut) -> Result<()> {
        let start = out.len();
        out.reserve(widths.prefix_size());
        out.put_slice(HEAP_MAGIC);
        out.put_u8(HEAP_VERSION);
        out.put_bytes(0, RESERVED_LEN);
        widths.put_length(out, self.dblk_size)?;
        widths.put_length(out, self.free_list_head)?;
        widths.put_addr(out, self.dblk_addr)?;

        let written = out.len() - start;
        out.put_bytes(0, widths.prefix_size() - written);
        Ok(())
    }

    /// Decode a prefix from the start of `image`
    pub fn decode(widths: &IntWidths, image: &[u8]) -> Result<Self> {
        if image.len() < widths.prefix_size() {
            return Err(Error::CorruptFormat(format!(
                "Prefix needs {} bytes, only {} available",
                widths.prefix_size(),
                image.len()
            )));
        }

        let mut buf = image;
        if &buf[..MAGIC_LEN] != HEAP_MAGIC {
            return Err(Error::CorruptFormat(format!(
                "Bad heap signature {:02x?}",
                &buf[..MAGIC_LEN]
            )));
        }
        buf.advance(MAGIC_LEN);

        let version = buf.get_u8();
        if version != HEAP_VERSION {
            return Err(Error::CorruptFormat(format!(
                "Unsupported heap version {}",
                version
            )));
        }
        buf.advance(RESERVED_LEN);

        let dblk_size = widths.get_length(&mut buf);
        let free_list_head = widths.get_length(&mut buf);
        if free_list_head != FREE_NULL && free_list_head >= dblk_size {
            return Err(Error::CorruptFormat(format!(
                "Free list head {} outside data block of {} bytes",
                free_list_head, dblk_size
            )));
        }
        let dblk_addr = widths.get_addr(&mut buf);

        Ok(Self {
            dblk_size,
            free_list_head,
            dblk_addr,
        })
    }
}

/// Write one free node at the start of `dst`
pub fn encode_free_node(widths: &IntWidths, mut dst: &mut [u8], next: u64, size: u64) -> Result<()> {
    if dst.len() < 2 * widths.sizeof_size() {
        return Err(Error::OutOfRange(format!(
            "Free node needs {} bytes, block has {}",
            2 * widths.sizeof_size(),
            dst.len()
        )));
    }
    widths.put_length(&mut dst, next)?;
    widths.put_length(&mut dst, size)?;
    Ok(())
}

/// Read `(next_offset, size)` from the start of `src`
pub fn decode_free_node(widths: &IntWidths, mut src: &[u8]) -> Result<(u64, u64)> {
    if src.len() < 2 * widths.sizeof_size() {
        return Err(Error::CorruptFormat(format!(
            "Free node truncated: {} bytes",
            src.len()
        )));
    }
    let next = widths.get_length(&mut src);
    let size = widths.get_length(&mut src);
    Ok((next, size))
}

/// Embed the in-memory free list into the data block image, head first
pub fn encode_free_list(widths: &IntWidths, image: &mut [u8], blocks: &[FreeBlock]) -> Result<()> {
    for (i, block) in blocks.iter().enumerate() {
        let next = blocks.get(i + 1).map_or(FREE_NULL, |b| b.offset as u64);
        let end = block.end();
        if end > image.len() {
            return Err(Error::OutOfRange(format!(
                "Free block {}+{} past data block of {} bytes",
                block.offset,
                block.size,
                image.len()
            )));
        }
        encode_free_node(widths, &mut image[block.offset..end], next, block.size as u64)?;
    }
    Ok(())
}

/// Rebuild the free list by walking the embedded nodes from `head`
pub fn decode_free_list(widths: &IntWidths, image: &[u8], head: u64) -> Result<Vec<FreeBlock>> {
    let dblk_size = image.len() as u64;
    // every node takes at least a node's worth of bytes, so a longer chain is a cycle
    let max_nodes = image.len() / widths.free_node_size().max(1);
    let mut blocks = Vec::new();
    let mut cursor = head;

    while cursor != FREE_NULL {
        if cursor >= dblk_size {
            return Err(Error::CorruptFormat(format!(
                "Free list offset {} outside data block of {} bytes",
                cursor, dblk_size
            )));
        }
        if blocks.len() >= max_nodes {
            return Err(Error::CorruptFormat(
                "Free list longer than the data block allows (cycle?)".to_string(),
            ));
        }

        let offset = cursor as usize;
        let (next, size) = decode_free_node(widths, &image[offset..])?;
        if cursor.checked_add(size).map_or(true, |end| end > dblk_size) {
            return Err(Error::CorruptFormat(format!(
                "Free block {}+{} past data block of {} bytes",
                offset, size, dblk_size
            )));
        }

        blocks.push(FreeBlock::new(offset, size as usize));
        cursor = next;
    }

    Ok(blocks)
}
