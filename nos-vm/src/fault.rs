//! Page fault resolution and user memory access
//!
//! A fault on a declared page loads the page from its source: the file for
//! executable and mapped pages, the swap slot for anonymous ones. A fault on
//! an undeclared page grows the stack if the access is close enough below
//! the stack pointer and the stack stays within its ceiling; anything else
//! is illegal and kills the process.
//!
//! The page tables lock is held for the whole resolution, so a page is never
//! loaded twice and a half-loaded frame is never chosen for eviction.

use nos_api::error::{Error, Result, invalid_argument};
use nos_api::{EXIT_FAILURE, Pid};

use crate::page::{Backing, FileBacking, PageDescriptor, PageRef, PageTables};
use crate::physical::{AllocFlags, FrameId, PAGE_SIZE, PhysAddr};
use crate::swap::SwapSlot;
use crate::virtual_mem::VirtAddr;
use crate::vm::{VirtualMemory, VmCounters};

/// Result of [`VirtualMemory::resolve_or_reject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page holding the address is resident.
    Resident,
    /// The process was killed.
    Terminated {
        /// Exit status reported to the process manager
        status: i32,
        /// Why the fault could not be resolved
        cause: Error,
    },
}

impl FaultOutcome {
    /// True if the faulting access may be retried.
    pub fn is_resident(&self) -> bool {
        matches!(self, FaultOutcome::Resident)
    }
}

impl VirtualMemory {
    /// Fault entry point: makes the page containing `addr` resident in
    /// `pid`, or terminates `pid`.
    ///
    /// `sp` is the user stack pointer at the time of the fault.
    pub fn resolve_or_reject(&self, pid: Pid, addr: VirtAddr, sp: VirtAddr) -> FaultOutcome {
        match self.resolve(pid, addr, sp) {
            Ok(()) => FaultOutcome::Resident,
            Err(cause) => {
                self.terminate(pid, &cause);
                FaultOutcome::Terminated { status: EXIT_FAILURE, cause }
            }
        }
    }

    /// Makes the page containing `addr` resident without terminating the
    /// process on failure.
    pub fn resolve(&self, pid: Pid, addr: VirtAddr, sp: VirtAddr) -> Result<()> {
        let mut pages = self.pages.lock();
        self.resolve_locked(&mut pages, pid, addr, sp)
    }

    fn resolve_locked(
        &self,
        pages: &mut PageTables,
        pid: Pid,
        addr: VirtAddr,
        sp: VirtAddr,
    ) -> Result<()> {
        if !self.layout.is_user_address(addr) {
            return Err(Error::IllegalAccess(addr.0));
        }
        let owner = PageRef { pid, page: addr.page_round_down() };

        let Some(descriptor) = pages.get(owner) else {
            if self.layout.is_stack_growth(addr, sp) {
                return self.grow_stack(pages, owner);
            }
            return Err(Error::IllegalAccess(addr.0));
        };
        if descriptor.is_resident() {
            return Ok(());
        }

        let writable = descriptor.writable();
        match descriptor.backing().clone() {
            Backing::Executable(source) | Backing::Mapped(source) => {
                self.load_file(pages, owner, &source, writable)?;
            }
            Backing::Swap(Some(slot)) => self.load_swap(pages, owner, slot, writable)?,
            Backing::Swap(None) => return Err(invalid_argument("anonymous page has no content")),
        }
        VmCounters::bump(&self.counters.faults);
        Ok(())
    }

    fn load_file(
        &self,
        pages: &mut PageTables,
        owner: PageRef,
        source: &FileBacking,
        writable: bool,
    ) -> Result<()> {
        let flags = if source.read_bytes == 0 {
            AllocFlags::USER | AllocFlags::ZERO
        } else {
            AllocFlags::USER
        };
        let frame = self.acquire_frame(pages, flags, owner)?;

        if let Err(err) = self.fill_from_file(frame, source) {
            self.frames.release(frame);
            return Err(err);
        }
        self.map_frame(owner, frame, writable)?;
        mark_resident(pages, owner, frame);
        vm_trace!("fault: pid {} page {} loaded from file", owner.pid, owner.page);
        Ok(())
    }

    fn fill_from_file(&self, frame: FrameId, source: &FileBacking) -> Result<()> {
        let mut bytes = self.frames.bytes(frame);
        if source.read_bytes > 0 {
            let file = source
                .file
                .as_ref()
                .ok_or_else(|| invalid_argument("page has bytes to read but no file"))?;
            let read = {
                let _fs = self.fs_lock.lock();
                file.read_at(&mut bytes[..source.read_bytes], source.offset)
            };
            if read != source.read_bytes {
                return Err(Error::ShortRead { expected: source.read_bytes, actual: read });
            }
        }
        bytes[source.read_bytes..].fill(0);
        Ok(())
    }

    fn load_swap(
        &self,
        pages: &mut PageTables,
        owner: PageRef,
        slot: SwapSlot,
        writable: bool,
    ) -> Result<()> {
        let frame = self.acquire_frame(pages, AllocFlags::USER, owner)?;
        self.map_frame(owner, frame, writable)?;

        let read = self.swap.read(&mut self.frames.bytes(frame), slot);
        if let Err(err) = read {
            self.installer.uninstall(owner.pid, owner.page.0);
            self.frames.release(frame);
            return Err(err);
        }
        mark_resident(pages, owner, frame);
        VmCounters::bump(&self.counters.swap_ins);
        vm_trace!("fault: pid {} page {} read back from slot {}", owner.pid, owner.page, slot.0);
        Ok(())
    }

    fn grow_stack(&self, pages: &mut PageTables, owner: PageRef) -> Result<()> {
        let frame = self.acquire_frame(pages, AllocFlags::USER | AllocFlags::ZERO, owner)?;
        self.map_frame(owner, frame, true)?;

        let declared = pages
            .table_mut(owner.pid)
            .declare(PageDescriptor::anonymous(owner.page, frame));
        if let Err(err) = declared {
            self.installer.uninstall(owner.pid, owner.page.0);
            self.frames.release(frame);
            return Err(err);
        }
        VmCounters::bump(&self.counters.stack_growths);
        VmCounters::bump(&self.counters.faults);
        vm_debug!("fault: pid {} stack grows to {}", owner.pid, owner.page);
        Ok(())
    }

    /// Installs `frame` for `owner`, releasing the frame if the installer
    /// refuses.
    fn map_frame(&self, owner: PageRef, frame: FrameId, writable: bool) -> Result<()> {
        let phys = frame.start_address().as_usize();
        if !self.installer.install(owner.pid, owner.page.0, phys, writable) {
            self.frames.release(frame);
            return Err(Error::InstallFailed(owner.page.0));
        }
        Ok(())
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as needed.
    ///
    /// Any failure terminates `pid`.
    pub fn read_user(&self, pid: Pid, addr: VirtAddr, buf: &mut [u8], sp: VirtAddr) -> Result<()> {
        self.access_user(pid, addr, buf.len(), sp, false, |frame, page_offset, done, len| {
            buf[done..done + len].copy_from_slice(&frame[page_offset..page_offset + len]);
        })
    }

    /// Copies `buf` into user memory at `addr`, faulting pages in as needed
    /// and marking them dirty.
    ///
    /// A write to a read-only page, or any other failure, terminates `pid`.
    pub fn write_user(&self, pid: Pid, addr: VirtAddr, buf: &[u8], sp: VirtAddr) -> Result<()> {
        self.access_user(pid, addr, buf.len(), sp, true, |frame, page_offset, done, len| {
            frame[page_offset..page_offset + len].copy_from_slice(&buf[done..done + len]);
        })
    }

    /// Makes every page of `[addr, addr + len)` resident, as the system call
    /// layer does before it trusts a user buffer.
    ///
    /// Any failure terminates `pid`.
    pub fn validate_user_range(
        &self,
        pid: Pid,
        addr: VirtAddr,
        len: usize,
        sp: VirtAddr,
    ) -> Result<()> {
        self.access_user(pid, addr, len, sp, false, |_, _, _, _| {})
    }

    /// Walks `[addr, addr + len)` page by page under the page tables lock,
    /// resolving each page and handing its frame bytes to `copy` as
    /// `(bytes, offset in page, bytes done so far, chunk length)`.
    fn access_user(
        &self,
        pid: Pid,
        addr: VirtAddr,
        len: usize,
        sp: VirtAddr,
        write: bool,
        mut copy: impl FnMut(&mut [u8], usize, usize, usize),
    ) -> Result<()> {
        let walked = {
            let mut pages = self.pages.lock();
            let mut done = 0;
            let mut walked = Ok(());
            while done < len {
                let Some(cursor) = addr.checked_add(done) else {
                    walked = Err(Error::IllegalAccess(addr.0));
                    break;
                };
                let chunk = (PAGE_SIZE - cursor.page_offset()).min(len - done);
                match self.user_frame(&mut pages, pid, cursor, sp, write) {
                    Ok(frame) => {
                        let mut bytes = self.frames.bytes(frame);
                        copy(&mut bytes[..], cursor.page_offset(), done, chunk);
                    }
                    Err(err) => {
                        walked = Err(err);
                        break;
                    }
                }
                done += chunk;
            }
            walked
        };
        walked.inspect_err(|err| self.terminate(pid, err))
    }

    /// Resolves the page containing `addr` and returns the frame installed
    /// for it.
    fn user_frame(
        &self,
        pages: &mut PageTables,
        pid: Pid,
        addr: VirtAddr,
        sp: VirtAddr,
        write: bool,
    ) -> Result<FrameId> {
        self.resolve_locked(pages, pid, addr, sp)?;
        let page = addr.page_round_down();
        let writable = pages.lookup(pid, page).is_some_and(PageDescriptor::writable);
        if write && !writable {
            return Err(Error::WriteToReadOnly(addr.0));
        }
        let phys = self
            .installer
            .translate(pid, page.0)
            .ok_or(Error::IllegalAccess(addr.0))?;
        if write {
            self.installer.set_dirty(pid, page.0, true);
        }
        Ok(FrameId::containing(PhysAddr::new(phys)))
    }
}

fn mark_resident(pages: &mut PageTables, owner: PageRef, frame: FrameId) {
    if let Some(descriptor) = pages.get_mut(owner) {
        descriptor.mark_resident(frame);
    }
}
