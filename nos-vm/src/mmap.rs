//! Memory-mapped files
//!
//! Each process keeps a table of its active mappings. A mapping covers the
//! whole file, one page descriptor per page starting at a page-aligned
//! address, with the final partial page zero-padded. Mapped pages are paged
//! against their file: eviction and unmap write them back instead of using
//! swap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use hashbrown::HashMap;

use nos_api::error::{Error, Result, out_of_memory};
use nos_api::{
    Fd, FileHandle, MAP_FAILED, MapId, MmapRejection, Pid, STDIN_FILENO, STDOUT_FILENO,
};

use crate::page::{Backing, FileBacking, PageDescriptor};
use crate::physical::PAGE_SIZE;
use crate::virtual_mem::VirtAddr;
use crate::vm::VirtualMemory;

/// One active mapping.
#[derive(Clone)]
pub struct MappedFile {
    id: MapId,
    fd: Fd,
    file: Arc<dyn FileHandle>,
    start: VirtAddr,
    page_count: usize,
}

impl MappedFile {
    /// Mapping id returned to the process.
    pub fn id(&self) -> MapId {
        self.id
    }

    /// Descriptor the mapping was created from.
    pub fn fd(&self) -> Fd {
        self.fd
    }

    /// Independent handle the pages are backed by.
    pub fn file(&self) -> &Arc<dyn FileHandle> {
        &self.file
    }

    /// First mapped page.
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// End of the mapped range, exclusive.
    pub fn end(&self) -> VirtAddr {
        VirtAddr(self.start.0 + self.page_count * PAGE_SIZE)
    }

    /// Number of pages the mapping created.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Every page of the range, in address order.
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        (0..self.page_count).map(move |i| VirtAddr(self.start.0 + i * PAGE_SIZE))
    }
}

impl core::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedFile")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("start", &self.start)
            .field("page_count", &self.page_count)
            .finish()
    }
}

/// Mappings of one process. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct MappingTable {
    next_id: MapId,
    mappings: BTreeMap<MapId, MappedFile>,
}

impl Default for MappingTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            mappings: BTreeMap::new(),
        }
    }
}

impl MappingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        fd: Fd,
        file: Arc<dyn FileHandle>,
        start: VirtAddr,
        page_count: usize,
    ) -> Result<MapId> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or_else(out_of_memory)?;
        self.mappings.insert(id, MappedFile { id, fd, file, start, page_count });
        Ok(id)
    }

    /// Mapping with `id`.
    pub fn get(&self, id: MapId) -> Option<&MappedFile> {
        self.mappings.get(&id)
    }

    /// Removes the mapping with `id`.
    pub fn remove(&mut self, id: MapId) -> Option<MappedFile> {
        self.mappings.remove(&id)
    }

    /// Active mappings in id order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedFile> {
        self.mappings.values()
    }

    /// Number of active mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Mapping tables of every process.
#[derive(Debug, Default)]
pub struct MappingTables {
    tables: HashMap<Pid, MappingTable>,
}

impl MappingTables {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of `pid`, if it ever mapped anything.
    pub fn table(&self, pid: Pid) -> Option<&MappingTable> {
        self.tables.get(&pid)
    }

    /// Table of `pid`, created on first use.
    pub fn table_mut(&mut self, pid: Pid) -> &mut MappingTable {
        self.tables.entry(pid).or_default()
    }

    /// Removes mapping `id` of `pid`.
    pub fn remove_mapping(&mut self, pid: Pid, id: MapId) -> Option<MappedFile> {
        self.tables.get_mut(&pid)?.remove(id)
    }

    /// Detaches the table of `pid`.
    pub fn remove_process(&mut self, pid: Pid) -> Option<MappingTable> {
        self.tables.remove(&pid)
    }
}

impl VirtualMemory {
    /// Maps the whole file open as `fd` in `pid` at `addr`.
    ///
    /// A rejected request leaves the address space untouched and returns
    /// [`Error::MappingRejected`].
    pub fn create_mapping(&self, pid: Pid, fd: Fd, addr: VirtAddr) -> Result<MapId> {
        if fd == STDIN_FILENO || fd == STDOUT_FILENO {
            return Err(MmapRejection::ReservedDescriptor.into());
        }
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(MmapRejection::BadAddress.into());
        }
        let opened = self.files.file(pid, fd).ok_or(MmapRejection::BadDescriptor)?;
        let (file, length) = {
            let _fs = self.fs_lock.lock();
            let file = opened.reopen().ok_or(MmapRejection::Unreadable)?;
            let length = file.length();
            (file, length)
        };
        if length == 0 {
            return Err(MmapRejection::EmptyFile.into());
        }

        let page_count = length.div_ceil(PAGE_SIZE);
        if !self.layout.is_user_range(addr, page_count * PAGE_SIZE) {
            return Err(MmapRejection::OutOfRange.into());
        }

        let mut pages = self.pages.lock();
        let table = pages.table_mut(pid);
        if table.any_declared(addr, page_count) {
            return Err(MmapRejection::Overlap.into());
        }

        for i in 0..page_count {
            let offset = i * PAGE_SIZE;
            let read_bytes = PAGE_SIZE.min(length - offset);
            let page = VirtAddr(addr.0 + offset);
            let declared =
                FileBacking::new(Some(file.clone()), offset, read_bytes, PAGE_SIZE - read_bytes)
                    .and_then(|source| PageDescriptor::from_file(page, Backing::Mapped(source), true))
                    .and_then(|descriptor| table.declare(descriptor).map(|_| ()));
            if let Err(err) = declared {
                for j in 0..i {
                    table.remove(VirtAddr(addr.0 + j * PAGE_SIZE));
                }
                return Err(err);
            }
        }

        let id = self.mappings.lock().table_mut(pid).insert(fd, file, addr, page_count);
        match id {
            Ok(id) => {
                vm_debug!(
                    "mmap: pid {} fd {} -> id {} at {} ({} pages)",
                    pid,
                    fd,
                    id,
                    addr,
                    page_count
                );
                Ok(id)
            }
            Err(err) => {
                for i in 0..page_count {
                    table.remove(VirtAddr(addr.0 + i * PAGE_SIZE));
                }
                Err(err)
            }
        }
    }

    /// Removes mapping `id` of `pid` and every page it created.
    ///
    /// Resident pages are written back if dirty and their frames released.
    /// An unknown id is [`Error::UnknownMapping`].
    pub fn destroy_mapping(&self, pid: Pid, id: MapId) -> Result<()> {
        let mut pages = self.pages.lock();
        let mapping = self
            .mappings
            .lock()
            .remove_mapping(pid, id)
            .ok_or(Error::UnknownMapping(id))?;

        let table = pages.table_mut(pid);
        for page in mapping.pages() {
            if let Some(descriptor) = table.remove(page) {
                self.discard_page(pid, &descriptor);
            }
        }
        vm_debug!("munmap: pid {} id {} ({} pages)", pid, id, mapping.page_count());
        Ok(())
    }

    /// `mmap` system call: returns the new id, or [`MAP_FAILED`].
    ///
    /// Rejections leave the process running. Any other failure kills it.
    pub fn mmap(&self, pid: Pid, fd: Fd, addr: VirtAddr) -> MapId {
        match self.create_mapping(pid, fd, addr) {
            Ok(id) => id,
            Err(Error::MappingRejected(reason)) => {
                vm_debug!("mmap: pid {} fd {} at {} rejected: {}", pid, fd, addr, reason);
                MAP_FAILED
            }
            Err(err) => {
                self.terminate(pid, &err);
                MAP_FAILED
            }
        }
    }

    /// `munmap` system call. Unmapping an id the process does not own kills
    /// the process.
    pub fn munmap(&self, pid: Pid, id: MapId) -> Result<()> {
        self.destroy_mapping(pid, id).inspect_err(|err| self.terminate(pid, err))
    }

    /// Snapshot of mapping `id` of `pid`.
    pub fn mapping(&self, pid: Pid, id: MapId) -> Option<MappedFile> {
        self.mappings.lock().table(pid)?.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let mut table = MappingTable::new();
        let file: Arc<dyn FileHandle> = Arc::new(crate::devices::MemFile::new(b"x"));
        let a = table.insert(2, file.clone(), VirtAddr(0x1000_0000), 1).unwrap();
        let b = table.insert(2, file, VirtAddr(0x2000_0000), 3).unwrap();
        assert_eq!((a, b), (1, 2));

        let second = table.get(b).unwrap();
        assert_eq!(second.end(), VirtAddr(0x2000_3000));
        assert_eq!(second.pages().collect::<alloc::vec::Vec<_>>().len(), 3);

        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_registry_per_process() {
        let mut tables = MappingTables::new();
        assert!(tables.table(1).is_none());
        assert!(tables.table_mut(1).is_empty());
        assert!(tables.remove_process(1).is_some());
    }
}
