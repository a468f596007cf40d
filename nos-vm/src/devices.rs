//! In-memory collaborators
//!
//! RAM-backed implementations of the block device, file and descriptor table
//! interfaces. The kernel wires real drivers in their place; these serve
//! bring-up, tests and benchmarks.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use nos_api::error::{Result, io_error};
use nos_api::{BLOCK_SECTOR_SIZE, BlockDevice, Fd, FileDescriptorTable, FileHandle, Pid};

/// A block device held entirely in memory
pub struct RamDisk {
    storage: Mutex<Vec<u8>>,
    sectors: usize,
}

impl RamDisk {
    /// Creates a zeroed disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            storage: Mutex::new(alloc::vec![0; sectors * BLOCK_SECTOR_SIZE]),
            sectors,
        }
    }

    fn range(&self, sector: usize, len: usize) -> Result<core::ops::Range<usize>> {
        if sector >= self.sectors {
            return Err(io_error("sector out of range"));
        }
        if len != BLOCK_SECTOR_SIZE {
            return Err(io_error("transfer is not one sector"));
        }
        let offset = sector * BLOCK_SECTOR_SIZE;
        Ok(offset..offset + BLOCK_SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.storage.lock()[range]);
        Ok(())
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) -> Result<()> {
        let range = self.range(sector, buf.len())?;
        self.storage.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

/// A file held in memory.
///
/// Clones and reopened handles share the same bytes, like two open file
/// descriptions of one inode.
#[derive(Clone)]
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    reopenable: bool,
}

impl MemFile {
    /// Creates a file holding `contents`.
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
            reopenable: true,
        }
    }

    /// Creates a file whose `reopen` always fails.
    pub fn unreopenable(contents: &[u8]) -> Self {
        Self {
            reopenable: false,
            ..Self::new(contents)
        }
    }

    /// Returns a copy of the current file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Shrinks the file to `len` bytes.
    pub fn truncate(&self, len: usize) {
        self.data.lock().truncate(len);
    }
}

impl FileHandle for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn reopen(&self) -> Option<Arc<dyn FileHandle>> {
        if !self.reopenable {
            return None;
        }
        Some(Arc::new(self.clone()))
    }
}

/// Per-process descriptor table keyed by `(pid, fd)`
#[derive(Default)]
pub struct FileTable {
    files: Mutex<HashMap<(Pid, Fd), Arc<dyn FileHandle>>>,
}

impl FileTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `fd` of process `pid` to `file`.
    pub fn open(&self, pid: Pid, fd: Fd, file: Arc<dyn FileHandle>) {
        self.files.lock().insert((pid, fd), file);
    }

    /// Unbinds `fd` of process `pid`.
    pub fn close(&self, pid: Pid, fd: Fd) -> bool {
        self.files.lock().remove(&(pid, fd)).is_some()
    }
}

impl FileDescriptorTable for FileTable {
    fn file(&self, pid: Pid, fd: Fd) -> Option<Arc<dyn FileHandle>> {
        self.files.lock().get(&(pid, fd)).cloned()
    }
}
