//! Frame acquisition and FIFO eviction
//!
//! A frame request first tries the physical pool. When the pool is empty the
//! oldest registered frame whose page is resident is taken away from its
//! page: a mapped page goes back to its file at its own offset, anything
//! else goes to a fresh swap slot and becomes an anonymous page. The freed
//! frame is then handed to the requester. The victim may belong to any
//! process. A victim that cannot be saved stays resident, goes to the back
//! of the queue and the next candidate is tried.

use alloc::vec::Vec;

use nos_api::error::{Error, Result, invalid_argument};

use crate::frame::FrameDescriptor;
use crate::page::{Backing, PageRef, PageTables};
use crate::physical::{AllocFlags, FrameId};
use crate::vm::{VirtualMemory, VmCounters};

impl VirtualMemory {
    /// Returns a registered frame for `owner`, evicting one page if the pool
    /// is empty.
    ///
    /// `pages` is the held page tables lock. Fails with
    /// [`Error::OutOfMemory`] when nothing can be evicted, or with the last
    /// write-out error when no resident frame could be saved.
    pub(crate) fn acquire_frame(
        &self,
        pages: &mut PageTables,
        flags: AllocFlags,
        owner: PageRef,
    ) -> Result<FrameId> {
        if let Some(frame) = self.frames.try_acquire(flags, owner)? {
            return Ok(frame);
        }
        self.evict_one(pages)?;
        self.frames
            .try_acquire(flags, owner)?
            .ok_or(Error::OutOfMemory)
    }

    /// Evicts the oldest resident frame whose content can be saved and
    /// returns it to the pool.
    ///
    /// A victim whose write-out fails stays resident and moves to the tail
    /// of the queue, and the next candidate is tried. Fails with the last
    /// write-out error once every candidate has failed, or with
    /// [`Error::OutOfMemory`] when there was no candidate at all.
    pub(crate) fn evict_one(&self, pages: &mut PageTables) -> Result<()> {
        let mut failed = Vec::new();
        let mut last_err = None;
        let evicted = loop {
            let Some(victim) = self.frames.select_victim(|owner| pages.is_resident(owner)) else {
                break Err(last_err.unwrap_or(Error::OutOfMemory));
            };
            match self.write_out(pages, victim) {
                Ok(()) => break Ok(victim),
                Err(err) => {
                    vm_warn!(
                        "evict: pid {} page {} stays resident: {}",
                        victim.owner.pid,
                        victim.owner.page,
                        err
                    );
                    failed.push(victim);
                    last_err = Some(err);
                }
            }
        };
        for victim in failed {
            self.frames.requeue(victim);
        }

        let victim = evicted.inspect_err(|err| vm_error!("evict: nothing evictable: {}", err))?;
        self.installer.uninstall(victim.owner.pid, victim.owner.page.0);
        self.frames.free_evicted(victim.frame);
        VmCounters::bump(&self.counters.evictions);
        Ok(())
    }

    /// Saves the victim's content and marks its page non-resident.
    fn write_out(&self, pages: &mut PageTables, victim: FrameDescriptor) -> Result<()> {
        let PageRef { pid, page } = victim.owner;
        let descriptor = pages
            .get_mut(victim.owner)
            .ok_or_else(|| invalid_argument("victim has no page"))?;

        match descriptor.backing() {
            Backing::Mapped(source) => {
                let source = source.clone();
                self.write_back(&source, victim.frame)?;
                descriptor.mark_written_back();
                vm_debug!("evict: pid {} page {} -> file @{:#x}", pid, page, source.offset);
            }
            Backing::Executable(_) | Backing::Swap(_) => {
                let slot = self.swap.write(&self.frames.bytes(victim.frame))?;
                descriptor.mark_swapped(slot);
                VmCounters::bump(&self.counters.swap_outs);
                vm_debug!("evict: pid {} page {} -> swap slot {}", pid, page, slot.0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use nos_api::{FileHandle, Pid, ProcessControl};

    use crate::config::VmConfig;
    use crate::devices::{FileTable, MemFile, RamDisk};
    use crate::page::BackingKind;
    use crate::page_table::PageDirectory;
    use crate::physical::PAGE_SIZE;
    use crate::swap::SECTORS_PER_PAGE;
    use crate::virtual_mem::VirtAddr;
    use crate::vm::{Collaborators, VirtualMemory};

    struct NoProcesses;

    impl ProcessControl for NoProcesses {
        fn terminate(&self, _pid: Pid, _status: i32) {}
    }

    fn vm(frames: usize, swap_slots: usize) -> VirtualMemory {
        let collaborators = Collaborators {
            swap_device: Arc::new(RamDisk::new(swap_slots * SECTORS_PER_PAGE)),
            installer: Arc::new(PageDirectory::new()),
            files: Arc::new(FileTable::new()),
            processes: Arc::new(NoProcesses),
        };
        VirtualMemory::new(VmConfig::default().with_frame_budget(frames), collaborators).unwrap()
    }

    fn page(n: usize) -> VirtAddr {
        VirtAddr(0x0804_8000 + n * PAGE_SIZE)
    }

    #[test]
    fn test_eviction_is_fifo() {
        let vm = vm(2, 4);
        for n in 0..3 {
            vm.declare(1, None, 0, page(n), 0, PAGE_SIZE, true).unwrap();
            vm.resolve(1, page(n), VirtAddr(0xbfff_f000)).unwrap();
        }
        assert!(!vm.is_resident(1, page(0)));
        assert!(vm.is_resident(1, page(1)));
        assert!(vm.is_resident(1, page(2)));

        let evicted = vm.page(1, page(0)).unwrap();
        assert_eq!(evicted.kind(), BackingKind::Swap);
        assert!(evicted.swap_slot().is_some_and(|slot| vm.swap().is_occupied(slot)));
        assert_eq!(vm.stats().evictions, 1);
    }

    #[test]
    fn test_swap_full_keeps_victim_resident() {
        let vm = vm(1, 0);
        vm.declare(1, None, 0, page(0), 0, PAGE_SIZE, true).unwrap();
        vm.declare(1, None, 0, page(1), 0, PAGE_SIZE, true).unwrap();
        vm.resolve(1, page(0), VirtAddr(0xbfff_f000)).unwrap();

        assert_eq!(vm.resolve(1, page(1), VirtAddr(0xbfff_f000)), Err(nos_api::Error::OutOfSwap));
        assert!(vm.is_resident(1, page(0)));
        assert!(!vm.is_resident(1, page(1)));
        assert_eq!(vm.frames().registered().len(), 1);
    }

    #[test]
    fn test_executable_page_becomes_anonymous() {
        let vm = vm(1, 2);
        let file: Arc<dyn FileHandle> = Arc::new(MemFile::new(&[9u8; PAGE_SIZE]));
        vm.declare(1, Some(file), 0, page(0), PAGE_SIZE, 0, false).unwrap();
        vm.declare(1, None, 0, page(1), 0, PAGE_SIZE, true).unwrap();

        vm.resolve(1, page(0), VirtAddr(0xbfff_f000)).unwrap();
        vm.resolve(1, page(1), VirtAddr(0xbfff_f000)).unwrap();

        let evicted = vm.page(1, page(0)).unwrap();
        assert_eq!(evicted.kind(), BackingKind::Swap);
        assert!(!evicted.writable());
    }
}
