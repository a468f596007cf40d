//! Virtual memory facade
//!
//! [`VirtualMemory`] owns the four core structures (frame table, swap store,
//! supplemental page tables, mapped file tables) together with the
//! collaborators they talk to. Fault resolution, eviction and memory-mapped
//! files are implemented on it in their own modules.
//!
//! # Locking
//!
//! Locks are always taken in this order:
//!
//! 1. `pages` (all supplemental page tables)
//! 2. the frame registry, released before any I/O
//! 3. the swap store or `fs_lock`
//!
//! `mappings` is only ever taken after `pages`. The physical free list and
//! the per-frame byte locks are leaves.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};
use static_assertions::assert_impl_all;

use nos_api::error::{Error, Result, invalid_argument};
use nos_api::{
    BlockDevice, EXIT_FAILURE, FileDescriptorTable, FileHandle, PageInstaller, Pid,
    ProcessControl,
};

use crate::config::VmConfig;
use crate::frame::FrameTable;
use crate::layout::AddressSpaceLayout;
use crate::mmap::MappingTables;
use crate::page::{Backing, FileBacking, PageDescriptor, PageTables};
use crate::physical::{FrameId, PAGE_SIZE};
use crate::swap::SwapStore;
use crate::virtual_mem::VirtAddr;

/// The rest of the kernel, as seen by the virtual memory core.
#[derive(Clone)]
pub struct Collaborators {
    /// Block device holding the swap area
    pub swap_device: Arc<dyn BlockDevice>,
    /// Per-process address translation structures
    pub installer: Arc<dyn PageInstaller>,
    /// Open file tables, used by `mmap`
    pub files: Arc<dyn FileDescriptorTable>,
    /// Process manager, told about every kill
    pub processes: Arc<dyn ProcessControl>,
}

/// Point-in-time counters of the virtual memory core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Faults that made a page resident
    pub faults: usize,
    /// Frames taken away from their page
    pub evictions: usize,
    /// Evicted pages written to swap
    pub swap_outs: usize,
    /// Pages read back from swap
    pub swap_ins: usize,
    /// Mapped pages written back to their file
    pub write_backs: usize,
    /// Pages created by stack growth
    pub stack_growths: usize,
    /// Processes killed by the core
    pub terminations: usize,
    /// Frames currently registered
    pub resident_frames: usize,
    /// Frames still free in the pool
    pub free_frames: usize,
    /// Swap slots in use
    pub swap_slots_used: usize,
}

#[derive(Default)]
pub(crate) struct VmCounters {
    pub(crate) faults: AtomicUsize,
    pub(crate) evictions: AtomicUsize,
    pub(crate) swap_outs: AtomicUsize,
    pub(crate) swap_ins: AtomicUsize,
    pub(crate) write_backs: AtomicUsize,
    pub(crate) stack_growths: AtomicUsize,
    pub(crate) terminations: AtomicUsize,
}

impl VmCounters {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Demand-paged virtual memory for every user process.
pub struct VirtualMemory {
    pub(crate) layout: AddressSpaceLayout,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
    pub(crate) pages: Mutex<PageTables>,
    pub(crate) mappings: Mutex<MappingTables>,
    pub(crate) fs_lock: Mutex<()>,
    pub(crate) installer: Arc<dyn PageInstaller>,
    pub(crate) files: Arc<dyn FileDescriptorTable>,
    pub(crate) processes: Arc<dyn ProcessControl>,
    pub(crate) counters: VmCounters,
}

assert_impl_all!(VirtualMemory: Send, Sync);

impl VirtualMemory {
    /// Builds the core from a validated configuration.
    pub fn new(config: VmConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let swap = SwapStore::new(collaborators.swap_device);
        vm_info!(
            "vm: {} frames, {} swap slots, user space {:#x}..{:#x}",
            config.frame_budget,
            swap.capacity(),
            config.layout.user_base,
            config.layout.user_top
        );
        Ok(Self {
            layout: config.layout,
            frames: FrameTable::new(config.frame_budget),
            swap,
            pages: Mutex::new(PageTables::new()),
            mappings: Mutex::new(MappingTables::new()),
            fs_lock: Mutex::new(()),
            installer: collaborators.installer,
            files: collaborators.files,
            processes: collaborators.processes,
            counters: VmCounters::default(),
        })
    }

    /// Declares one non-resident executable page of `pid`.
    ///
    /// `read_length` bytes come from `file` at `offset`, the remaining
    /// `zero_fill_length` bytes are zeros. A page with nothing to read may
    /// omit the file.
    #[allow(clippy::too_many_arguments)]
    pub fn declare(
        &self,
        pid: Pid,
        file: Option<Arc<dyn FileHandle>>,
        offset: usize,
        upage: VirtAddr,
        read_length: usize,
        zero_fill_length: usize,
        writable: bool,
    ) -> Result<()> {
        let source = FileBacking::new(file, offset, read_length, zero_fill_length)?;
        let descriptor = PageDescriptor::from_file(upage, Backing::Executable(source), writable)?;
        if !self.layout.is_user_address(upage) {
            return Err(Error::IllegalAccess(upage.0));
        }
        self.pages.lock().table_mut(pid).declare(descriptor)?;
        Ok(())
    }

    /// Declares every page of an executable segment.
    ///
    /// The segment starts at page-aligned `upage` and file offset `offset`;
    /// its first `read_bytes` bytes come from the file, the following
    /// `zero_bytes` are zeros. The pair must cover whole pages.
    #[allow(clippy::too_many_arguments)]
    pub fn declare_segment(
        &self,
        pid: Pid,
        file: Option<Arc<dyn FileHandle>>,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or_else(|| invalid_argument("segment size overflows"))?;
        if total % PAGE_SIZE != 0 || !upage.is_page_aligned() || offset % PAGE_SIZE != 0 {
            return Err(invalid_argument("segment must cover whole aligned pages"));
        }
        let pages = total / PAGE_SIZE;
        if !self.layout.is_user_range(upage, total.max(1)) {
            return Err(Error::IllegalAccess(upage.0));
        }

        let mut remaining = read_bytes;
        for i in 0..pages {
            let page_read = remaining.min(PAGE_SIZE);
            let page = upage
                .checked_add_pages(i)
                .ok_or_else(|| invalid_argument("segment wraps around"))?;
            let file = if page_read > 0 { file.clone() } else { None };
            self.declare(
                pid,
                file,
                offset + i * PAGE_SIZE,
                page,
                page_read,
                PAGE_SIZE - page_read,
                writable,
            )?;
            remaining -= page_read;
        }
        vm_debug!("vm: pid {} segment {} ({} pages)", pid, upage, pages);
        Ok(())
    }

    /// Tears down the whole address space of `pid`.
    ///
    /// Dirty mapped pages are written back, frames and swap slots are
    /// released, and the page and mapping tables of the process disappear.
    pub fn exit_process(&self, pid: Pid) {
        let mut pages = self.pages.lock();
        let mappings = self.mappings.lock().remove_process(pid);
        let Some(mut table) = pages.remove_process(pid) else {
            return;
        };
        let declared = table.len();
        for descriptor in table.drain() {
            self.discard_page(pid, &descriptor);
        }
        vm_debug!(
            "vm: pid {} exited, {} pages, {} mappings",
            pid,
            declared,
            mappings.map_or(0, |m| m.len())
        );
    }

    /// Kills `pid` because of `cause`: tears down its address space, then
    /// reports [`EXIT_FAILURE`] to the process manager.
    pub fn terminate(&self, pid: Pid, cause: &Error) {
        vm_warn!("vm: terminating pid {}: {}", pid, cause);
        self.exit_process(pid);
        VmCounters::bump(&self.counters.terminations);
        self.processes.terminate(pid, EXIT_FAILURE);
    }

    /// Releases whatever holds the content of a descriptor being destroyed.
    ///
    /// The caller holds the page tables lock and has already removed
    /// `descriptor` from its table.
    pub(crate) fn discard_page(&self, pid: Pid, descriptor: &PageDescriptor) {
        let page = descriptor.page();
        if let Some(frame) = descriptor.frame() {
            if let Backing::Mapped(source) = descriptor.backing() {
                if self.installer.is_dirty(pid, page.0) {
                    if let Err(err) = self.write_back(source, frame) {
                        vm_error!("vm: lost write-back of pid {} page {}: {}", pid, page, err);
                    }
                }
            }
            self.installer.uninstall(pid, page.0);
            self.frames.release(frame);
        } else if let Some(slot) = descriptor.swap_slot() {
            self.swap.free(slot);
        }
    }

    /// Writes the file part of a mapped page back to its file.
    pub(crate) fn write_back(&self, source: &FileBacking, frame: FrameId) -> Result<()> {
        if source.read_bytes == 0 {
            return Ok(());
        }
        let file = source
            .file
            .as_ref()
            .ok_or_else(|| invalid_argument("mapped page has no file"))?;
        let bytes = self.frames.bytes(frame);
        let written = {
            let _fs = self.fs_lock.lock();
            file.write_at(&bytes[..source.read_bytes], source.offset)
        };
        if written != source.read_bytes {
            return Err(Error::ShortWrite { expected: source.read_bytes, actual: written });
        }
        VmCounters::bump(&self.counters.write_backs);
        Ok(())
    }

    /// Lock serializing every call into the file system.
    ///
    /// The system call layer takes it around its own file reads and writes
    /// so they never interleave with page loads and write-backs.
    pub fn filesystem_lock(&self) -> MutexGuard<'_, ()> {
        self.fs_lock.lock()
    }

    /// Snapshot of the descriptor of the page containing `addr`.
    pub fn page(&self, pid: Pid, addr: VirtAddr) -> Option<PageDescriptor> {
        self.pages.lock().lookup(pid, addr).cloned()
    }

    /// Whether the page containing `addr` is declared and resident.
    pub fn is_resident(&self, pid: Pid, addr: VirtAddr) -> bool {
        self.pages
            .lock()
            .lookup(pid, addr)
            .is_some_and(PageDescriptor::is_resident)
    }

    /// Number of pages declared by `pid`.
    pub fn declared_pages(&self, pid: Pid) -> usize {
        self.pages.lock().table(pid).map_or(0, |table| table.len())
    }

    /// User address space layout.
    pub fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    /// The frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The swap store.
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Current counters.
    pub fn stats(&self) -> VmStats {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        VmStats {
            faults: load(&self.counters.faults),
            evictions: load(&self.counters.evictions),
            swap_outs: load(&self.counters.swap_outs),
            swap_ins: load(&self.counters.swap_ins),
            write_backs: load(&self.counters.write_backs),
            stack_growths: load(&self.counters.stack_growths),
            terminations: load(&self.counters.terminations),
            resident_frames: self.frames.resident(),
            free_frames: self.frames.free_frames(),
            swap_slots_used: self.swap.used(),
        }
    }
}
