//! Collaborator interfaces consumed by the virtual memory core
//!
//! The core never touches a disk, a file system or a hardware page table
//! directly. It goes through the traits below, which the kernel implements
//! with its real drivers and which tests implement in memory.

use alloc::sync::Arc;

use crate::error::Result;
use crate::core::types::{Fd, Pid, RawPhysAddr, RawVirtAddr};

/// An open file, addressed by byte offset.
///
/// Implementations do their own internal locking; the virtual memory core
/// serializes all calls through its file system lock on top of that.
pub trait FileHandle: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the number read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes up to `buf.len()` bytes at `offset`, returning the number
    /// written. Writes never grow the file.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;

    /// Returns the file length in bytes.
    fn length(&self) -> usize;

    /// Opens an independent handle on the same file.
    fn reopen(&self) -> Option<Arc<dyn FileHandle>>;
}

/// A sector-addressed block device.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Reads one sector into `buf` (exactly `BLOCK_SECTOR_SIZE` bytes).
    fn read_sector(&self, sector: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes one sector from `buf` (exactly `BLOCK_SECTOR_SIZE` bytes).
    fn write_sector(&self, sector: usize, buf: &[u8]) -> Result<()>;
}

/// Per-process address translation structures.
///
/// This is the page directory of each process: it binds a user page to a
/// physical frame and tracks the hardware dirty bit.
pub trait PageInstaller: Send + Sync {
    /// Maps `upage` to `frame` in the address space of `pid`.
    ///
    /// Returns false if `upage` is already mapped or the translation table
    /// cannot grow.
    fn install(&self, pid: Pid, upage: RawVirtAddr, frame: RawPhysAddr, writable: bool) -> bool;

    /// Removes the translation for `upage`, if any.
    fn uninstall(&self, pid: Pid, upage: RawVirtAddr);

    /// Returns the frame currently backing `upage`.
    fn translate(&self, pid: Pid, upage: RawVirtAddr) -> Option<RawPhysAddr>;

    /// Returns true if `upage` was written since it was installed or last
    /// cleaned.
    fn is_dirty(&self, pid: Pid, upage: RawVirtAddr) -> bool;

    /// Sets or clears the dirty bit of `upage`.
    fn set_dirty(&self, pid: Pid, upage: RawVirtAddr, dirty: bool);
}

/// Per-process open file table, as kept by the system call layer.
pub trait FileDescriptorTable: Send + Sync {
    /// Returns the file behind `fd` in process `pid`.
    fn file(&self, pid: Pid, fd: Fd) -> Option<Arc<dyn FileHandle>>;
}
