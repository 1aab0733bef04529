//! Extent allocator
//!
//! Hands out byte ranges of a single file. New space comes from the end of
//! allocated space (EOA) unless a released extent fits first. Released
//! extents are kept sorted and coalesced; releasing the last extent pulls the
//! EOA back.

use super::FileSpace;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct SpaceState {
    eoa: u64,
    /// Released extents, sorted by address, never adjacent
    free: Vec<(u64, u64)>,
    /// Upper bound for the EOA
    limit: Option<u64>,
}

impl SpaceState {
    fn check_limit(&self, new_eoa: u64) -> Result<()> {
        match self.limit {
            Some(limit) if new_eoa > limit => Err(Error::Allocation(format!(
                "File space exhausted: need EOA {} but limit is {}",
                new_eoa, limit
            ))),
            _ => Ok(()),
        }
    }

    /// Drop released extents that now touch the EOA
    fn trim_tail(&mut self) {
        while let Some(&(addr, len)) = self.free.last() {
            if addr + len != self.eoa {
                break;
            }
            self.eoa = addr;
            self.free.pop();
        }
    }
}

/// File-space allocator over one file
#[derive(Debug, Default)]
pub struct ExtentAllocator {
    state: Mutex<SpaceState>,
}

impl ExtentAllocator {
    /// Start allocating at `eoa` (typically the current file length)
    pub fn new(eoa: u64) -> Self {
        Self {
            state: Mutex::new(SpaceState {
                eoa,
                ..SpaceState::default()
            }),
        }
    }

    /// Never let the EOA grow past `limit`
    pub fn with_limit(eoa: u64, limit: u64) -> Self {
        Self {
            state: Mutex::new(SpaceState {
                eoa,
                free: Vec::new(),
                limit: Some(limit),
            }),
        }
    }

    /// End of allocated space
    pub fn eoa(&self) -> u64 {
        self.state.lock().eoa
    }

    /// Released extents, sorted by address
    pub fn free_extents(&self) -> Vec<(u64, u64)> {
        self.state.lock().free.clone()
    }

    pub fn set_limit(&self, limit: Option<u64>) {
        self.state.lock().limit = limit;
    }
}

impl FileSpace for ExtentAllocator {
    fn allocate(&self, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(Error::Allocation("Zero-length allocation".to_string()));
        }
        let mut state = self.state.lock();

        if let Some(i) = state.free.iter().position(|&(_, size)| size >= len) {
            let (addr, size) = state.free[i];
            if size == len {
                state.free.remove(i);
            } else {
                state.free[i] = (addr + len, size - len);
            }
            debug!(addr, len, "Allocated file space from released extent");
            return Ok(addr);
        }

        let addr = state.eoa;
        let new_eoa = addr
            .checked_add(len)
            .ok_or_else(|| Error::Allocation("Address space overflow".to_string()))?;
        state.check_limit(new_eoa)?;
        state.eoa = new_eoa;

        debug!(addr, len, "Allocated file space at EOA");
        Ok(addr)
    }

    fn try_extend(&self, addr: u64, len: u64, extra: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let end = addr + len;

        if end == state.eoa {
            let new_eoa = end
                .checked_add(extra)
                .ok_or_else(|| Error::Allocation("Address space overflow".to_string()))?;
            state.check_limit(new_eoa)?;
            state.eoa = new_eoa;
            debug!(addr, len, extra, "Extended extent at EOA");
            return Ok(true);
        }

        if let Some(i) = state.free.iter().position(|&(a, _)| a == end) {
            let (a, size) = state.free[i];
            if size >= extra {
                if size == extra {
                    state.free.remove(i);
                } else {
                    state.free[i] = (a + extra, size - extra);
                }
                debug!(addr, len, extra, "Extended extent into released space");
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn free(&self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let end = addr + len;

        if end > state.eoa {
            return Err(Error::Allocation(format!(
                "Release of {}+{} past EOA {}",
                addr, len, state.eoa
            )));
        }
        if let Some(&(a, s)) = state.free.iter().find(|&&(a, s)| a < end && addr < a + s) {
            return Err(Error::Allocation(format!(
                "Release of {}+{} overlaps released extent {}+{}",
                addr, len, a, s
            )));
        }

        // Insert and keep sorted, then coalesce with the neighbours
        let i = state.free.partition_point(|&(a, _)| a < addr);
        state.free.insert(i, (addr, len));
        if i + 1 < state.free.len() && addr + len == state.free[i + 1].0 {
            let (_, next_len) = state.free.remove(i + 1);
            state.free[i].1 += next_len;
        }
        if i > 0 && state.free[i - 1].0 + state.free[i - 1].1 == addr {
            let (_, merged_len) = state.free.remove(i);
            state.free[i - 1].1 += merged_len;
        }
        state.trim_tail();

        debug!(addr, len, eoa = state.eoa, "Released file space");
        Ok(())
    }
}
