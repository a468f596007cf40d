//! NOS Virtual Memory
//!
//! Demand paging for user processes: pages are declared up front and only
//! backed by a physical frame on first access. When the frame pool runs dry
//! the oldest frame is evicted, either back to its memory-mapped file or to
//! the swap device. Undeclared accesses just below the stack pointer grow
//! the stack.
//!
//! # Architecture
//!
//! - **swap**: slot-addressed swap area with an occupancy bitmap
//! - **frame** / **eviction**: frame registry, FIFO victim selection and
//!   write-out
//! - **page**: per-process supplemental page tables
//! - **mmap**: per-process memory-mapped file tables
//! - **fault**: fault resolution, stack growth and user memory access
//! - **vm**: the [`VirtualMemory`] facade and process teardown
//!
//! The rest of the kernel is reached through the collaborator traits of
//! `nos-api`. In-memory implementations live in [`devices`] and
//! [`page_table`].
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use nos_vm::devices::{FileTable, RamDisk};
//! use nos_vm::page_table::PageDirectory;
//! use nos_vm::{Collaborators, VirtAddr, VirtualMemory, VmConfig};
//!
//! struct Reaper;
//!
//! impl nos_vm::ProcessControl for Reaper {
//!     fn terminate(&self, _pid: nos_vm::Pid, _status: i32) {}
//! }
//!
//! let collaborators = Collaborators {
//!     swap_device: Arc::new(RamDisk::new(64)),
//!     installer: Arc::new(PageDirectory::new()),
//!     files: Arc::new(FileTable::new()),
//!     processes: Arc::new(Reaper),
//! };
//! let vm = VirtualMemory::new(VmConfig::default().with_frame_budget(8), collaborators).unwrap();
//!
//! let sp = VirtAddr(0xbfff_f000);
//! assert!(vm.resolve_or_reject(1, VirtAddr(0xbfff_eff0), sp).is_resident());
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

#[macro_use]
mod logging;

pub mod config;
pub mod devices;
mod eviction;
pub mod fault;
pub mod frame;
pub mod layout;
pub mod mmap;
pub mod page;
pub mod page_table;
pub mod physical;
pub mod swap;
pub mod virtual_mem;
pub mod vm;

use spin::Once;

// Re-export API types
pub use nos_api::{
    BLOCK_SECTOR_SIZE, BlockDevice, EXIT_FAILURE, Error, ErrorClass, Fd, FileDescriptorTable,
    FileHandle, MAP_FAILED, MapId, MmapRejection, PageInstaller, Pid, ProcessControl,
    RawPhysAddr, RawVirtAddr, Result, STDIN_FILENO, STDOUT_FILENO,
};

pub use config::VmConfig;
pub use fault::FaultOutcome;
pub use frame::{FrameDescriptor, FrameTable};
pub use layout::AddressSpaceLayout;
pub use mmap::MappedFile;
pub use page::{Backing, BackingKind, FileBacking, PageDescriptor, PageRef};
pub use physical::{
    AllocFlags, FrameId, PAGE_SHIFT, PAGE_SIZE, PhysAddr, page_round_down, page_round_up,
};
pub use swap::{SwapSlot, SwapStore};
pub use virtual_mem::VirtAddr;
pub use vm::{Collaborators, VirtualMemory, VmStats};

static VM: Once<VirtualMemory> = Once::new();

/// Builds the process-wide virtual memory core.
///
/// Must run once at boot, before the first page fault. A second call fails
/// with [`Error::AlreadyInitialized`] and leaves the first instance in place.
pub fn init(config: VmConfig, collaborators: Collaborators) -> Result<&'static VirtualMemory> {
    if VM.is_completed() {
        return Err(Error::AlreadyInitialized);
    }
    let vm = VirtualMemory::new(config, collaborators)?;
    let mut created = false;
    let instance = VM.call_once(|| {
        created = true;
        vm
    });
    if !created {
        return Err(Error::AlreadyInitialized);
    }
    Ok(instance)
}

/// Returns the process-wide virtual memory core.
pub fn get() -> Result<&'static VirtualMemory> {
    VM.get().ok_or(Error::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    use crate::devices::{FileTable, RamDisk};
    use crate::page_table::PageDirectory;

    struct NoProcesses;

    impl ProcessControl for NoProcesses {
        fn terminate(&self, _pid: Pid, _status: i32) {}
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            swap_device: Arc::new(RamDisk::new(8)),
            installer: Arc::new(PageDirectory::new()),
            files: Arc::new(FileTable::new()),
            processes: Arc::new(NoProcesses),
        }
    }

    #[test]
    fn test_singleton_initializes_once() {
        let bad = VmConfig::default().with_frame_budget(0);
        assert!(init(bad, collaborators()).is_err());
        assert_eq!(get().err(), Some(Error::NotInitialized));

        let vm = init(VmConfig::default().with_frame_budget(2), collaborators()).unwrap();
        assert_eq!(vm.frames().budget(), 2);
        assert!(core::ptr::eq(vm, get().unwrap()));
        assert_eq!(
            init(VmConfig::default(), collaborators()).err(),
            Some(Error::AlreadyInitialized)
        );
    }
}
