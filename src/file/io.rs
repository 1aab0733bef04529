//! Block I/O devices

use super::BlockIo;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// In-memory device, used by tests and scratch stores
#[derive(Debug, Default)]
pub struct MemBlockIo {
    data: RwLock<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the whole device
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Number of `read_at` calls so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockIo for MemBlockIo {
    fn read_at(&self, addr: u64, len: usize) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read();
        let start = (addr as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write();
        let start = addr as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }
}

/// Device backed by a regular file
pub struct FileBlockIo {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileBlockIo {
    /// Open or create the file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("Failed to open {:?}: {}", path, e))))?;
        debug!("Opened heap file: {:?}", path);

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockIo for FileBlockIo {
    fn read_at(&self, addr: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        if addr >= file_len {
            return Ok(Bytes::new());
        }

        let len = len.min((file_len - addr) as usize);
        let mut data = vec![0u8; len];
        file.seek(SeekFrom::Start(addr))?;
        file.read_exact(&mut data)?;
        Ok(Bytes::from(data))
    }

    fn write_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.file.lock().metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
