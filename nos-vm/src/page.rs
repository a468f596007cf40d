//! Supplemental page table
//!
//! Every virtual page a process declares gets one [`PageDescriptor`], resident
//! or not. The descriptor records how to rebuild the page's content: from an
//! executable, from a mapped file, or from a swap slot. The hardware page
//! directory only knows about resident pages; this table knows about all of
//! them.
//!
//! All tables of all processes live in one [`PageTables`] registry guarded by
//! a single lock, because eviction inspects and updates descriptors of
//! processes other than the one that faulted.

use alloc::sync::Arc;
use core::fmt;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use nos_api::error::{Error, Result, busy, invalid_argument, out_of_memory};
use nos_api::{FileHandle, Pid};

use crate::physical::{FrameId, PAGE_SIZE};
use crate::swap::SwapSlot;
use crate::virtual_mem::VirtAddr;

/// Handle naming one page of one process.
///
/// Frames refer back to their page through this handle instead of a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    /// Owning process
    pub pid: Pid,
    /// Page-aligned user address
    pub page: VirtAddr,
}

/// Where a page's content comes from when it is (re)loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Segment of the program's executable
    ExecutableFile,
    /// Page of a memory-mapped file; written back on eviction
    MappedFile,
    /// Anonymous page; persisted to swap on eviction
    Swap,
}

/// File source of a page: `read_bytes` from `file` at `offset`, then
/// `zero_bytes` zeros. The two always add up to one page.
#[derive(Clone)]
pub struct FileBacking {
    /// Backing file; `None` only for pages with nothing to read
    pub file: Option<Arc<dyn FileHandle>>,
    /// Byte offset of the page in the file
    pub offset: usize,
    /// Bytes read from the file
    pub read_bytes: usize,
    /// Bytes zero-filled after the read
    pub zero_bytes: usize,
}

impl FileBacking {
    /// Validates the split of a page between file bytes and zeros.
    pub fn new(
        file: Option<Arc<dyn FileHandle>>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_SIZE) {
            return Err(invalid_argument("read and zero lengths must cover one page"));
        }
        if file.is_none() && read_bytes > 0 {
            return Err(invalid_argument("bytes to read without a file"));
        }
        Ok(Self { file, offset, read_bytes, zero_bytes })
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("has_file", &self.file.is_some())
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

/// Backing store of a page together with its source data.
#[derive(Debug, Clone)]
pub enum Backing {
    /// See [`BackingKind::ExecutableFile`]
    Executable(FileBacking),
    /// See [`BackingKind::MappedFile`]
    Mapped(FileBacking),
    /// See [`BackingKind::Swap`]; holds the slot while non-resident
    Swap(Option<SwapSlot>),
}

impl Backing {
    /// The kind tag of this backing.
    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::Executable(_) => BackingKind::ExecutableFile,
            Backing::Mapped(_) => BackingKind::MappedFile,
            Backing::Swap(_) => BackingKind::Swap,
        }
    }
}

/// Metadata for one declared virtual page.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    page: VirtAddr,
    backing: Backing,
    writable: bool,
    frame: Option<FrameId>,
}

impl PageDescriptor {
    /// Creates a non-resident page backed by a file.
    pub fn from_file(page: VirtAddr, backing: Backing, writable: bool) -> Result<Self> {
        if !page.is_page_aligned() {
            return Err(invalid_argument("page address must be page-aligned"));
        }
        if matches!(backing, Backing::Swap(_)) {
            return Err(invalid_argument("file page needs a file backing"));
        }
        Ok(Self { page, backing, writable, frame: None })
    }

    /// Creates a resident, writable, anonymous page living in `frame`.
    pub fn anonymous(page: VirtAddr, frame: FrameId) -> Self {
        Self {
            page,
            backing: Backing::Swap(None),
            writable: true,
            frame: Some(frame),
        }
    }

    /// Page-aligned user address.
    pub fn page(&self) -> VirtAddr {
        self.page
    }

    /// Backing kind.
    pub fn kind(&self) -> BackingKind {
        self.backing.kind()
    }

    /// Backing store with its source data.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Whether user writes are allowed.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whether a frame currently holds the page.
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Frame holding the page, if resident.
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    /// Swap slot holding the page, if it was swapped out.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.backing {
            Backing::Swap(slot) => slot,
            _ => None,
        }
    }

    /// File source of the page, if file-backed.
    pub fn file_backing(&self) -> Option<&FileBacking> {
        match &self.backing {
            Backing::Executable(source) | Backing::Mapped(source) => Some(source),
            Backing::Swap(_) => None,
        }
    }

    /// Records that `frame` now holds the page. A swap slot, if any, has
    /// been consumed by the load.
    pub(crate) fn mark_resident(&mut self, frame: FrameId) {
        if let Backing::Swap(slot) = &mut self.backing {
            *slot = None;
        }
        self.frame = Some(frame);
    }

    /// Records that the page left memory for `slot`; the page is anonymous
    /// from now on.
    pub(crate) fn mark_swapped(&mut self, slot: SwapSlot) {
        self.backing = Backing::Swap(Some(slot));
        self.frame = None;
    }

    /// Records that the page was written back to its mapped file.
    pub(crate) fn mark_written_back(&mut self) {
        debug_assert_eq!(self.kind(), BackingKind::MappedFile);
        self.frame = None;
    }
}

/// One process's declared pages, keyed by page address.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: HashMap<VirtAddr, PageDescriptor>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `descriptor` to the table.
    ///
    /// Fails if a page is already declared at that address, or with
    /// [`Error::OutOfMemory`] if the table cannot grow.
    pub fn declare(&mut self, descriptor: PageDescriptor) -> Result<&mut PageDescriptor> {
        let page = descriptor.page;
        if self.pages.contains_key(&page) {
            return Err(Error::AlreadyDeclared(page.0));
        }
        self.pages.try_reserve(1).map_err(|_| out_of_memory())?;
        Ok(self.pages.entry(page).or_insert(descriptor))
    }

    /// Finds the descriptor of the page containing `addr`.
    pub fn lookup(&self, addr: VirtAddr) -> Option<&PageDescriptor> {
        self.pages.get(&addr.page_round_down())
    }

    /// Mutable variant of [`lookup`](Self::lookup).
    pub fn lookup_mut(&mut self, addr: VirtAddr) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&addr.page_round_down())
    }

    /// Removes a non-resident descriptor.
    ///
    /// A resident page must have its frame released first.
    pub fn release(&mut self, page: VirtAddr) -> Result<PageDescriptor> {
        match self.pages.entry(page) {
            Entry::Occupied(entry) if entry.get().is_resident() => {
                Err(busy("page still holds a frame"))
            }
            Entry::Occupied(entry) => Ok(entry.remove()),
            Entry::Vacant(_) => Err(invalid_argument("page is not declared")),
        }
    }

    /// Removes a descriptor regardless of residency.
    pub(crate) fn remove(&mut self, page: VirtAddr) -> Option<PageDescriptor> {
        self.pages.remove(&page)
    }

    /// Returns true if any of `pages` pages starting at `start` is declared.
    pub fn any_declared(&self, start: VirtAddr, pages: usize) -> bool {
        (0..pages)
            .filter_map(|i| start.checked_add_pages(i))
            .any(|page| self.pages.contains_key(&page))
    }

    /// Iterates over every descriptor, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }

    /// Removes and yields every descriptor.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PageDescriptor> + '_ {
        self.pages.drain().map(|(_, descriptor)| descriptor)
    }

    /// Number of declared pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.pages.values().filter(|d| d.is_resident()).count()
    }
}

/// The supplemental page tables of every process.
#[derive(Debug, Default)]
pub struct PageTables {
    tables: HashMap<Pid, SupplementalPageTable>,
}

impl PageTables {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of `pid`, if the process declared anything.
    pub fn table(&self, pid: Pid) -> Option<&SupplementalPageTable> {
        self.tables.get(&pid)
    }

    /// Table of `pid`, created on first use.
    pub fn table_mut(&mut self, pid: Pid) -> &mut SupplementalPageTable {
        self.tables.entry(pid).or_default()
    }

    /// Descriptor of the page containing `addr` in process `pid`.
    pub fn lookup(&self, pid: Pid, addr: VirtAddr) -> Option<&PageDescriptor> {
        self.tables.get(&pid)?.lookup(addr)
    }

    /// Mutable variant of [`lookup`](Self::lookup).
    pub fn lookup_mut(&mut self, pid: Pid, addr: VirtAddr) -> Option<&mut PageDescriptor> {
        self.tables.get_mut(&pid)?.lookup_mut(addr)
    }

    /// Descriptor named by `owner`.
    pub fn get(&self, owner: PageRef) -> Option<&PageDescriptor> {
        self.lookup(owner.pid, owner.page)
    }

    /// Mutable descriptor named by `owner`.
    pub fn get_mut(&mut self, owner: PageRef) -> Option<&mut PageDescriptor> {
        self.lookup_mut(owner.pid, owner.page)
    }

    /// Whether the page named by `owner` is declared and resident.
    pub fn is_resident(&self, owner: PageRef) -> bool {
        self.get(owner).is_some_and(PageDescriptor::is_resident)
    }

    /// Detaches the whole table of `pid`.
    pub fn remove_process(&mut self, pid: Pid) -> Option<SupplementalPageTable> {
        self.tables.remove(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MemFile;

    fn file_page(addr: usize, read: usize) -> PageDescriptor {
        let file: Arc<dyn FileHandle> = Arc::new(MemFile::new(&[1u8; PAGE_SIZE]));
        let source = FileBacking::new(Some(file), 0, read, PAGE_SIZE - read).unwrap();
        PageDescriptor::from_file(VirtAddr(addr), Backing::Executable(source), false).unwrap()
    }

    #[test]
    fn test_file_backing_validation() {
        assert!(FileBacking::new(None, 0, 0, PAGE_SIZE).is_ok());
        assert!(FileBacking::new(None, 0, 1, PAGE_SIZE - 1).is_err());
        assert!(FileBacking::new(None, 0, 0, PAGE_SIZE - 1).is_err());
        assert!(FileBacking::new(None, 0, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_declare_and_lookup_rounds_down() {
        let mut table = SupplementalPageTable::new();
        table.declare(file_page(0x0804_8000, 100)).unwrap();

        let found = table.lookup(VirtAddr(0x0804_8abc)).unwrap();
        assert_eq!(found.page(), VirtAddr(0x0804_8000));
        assert_eq!(found.kind(), BackingKind::ExecutableFile);
        assert!(!found.is_resident());
        assert_eq!(found.file_backing().map(|b| b.read_bytes), Some(100));
        assert!(table.lookup(VirtAddr(0x0804_9000)).is_none());
    }

    #[test]
    fn test_one_descriptor_per_page() {
        let mut table = SupplementalPageTable::new();
        table.declare(file_page(0x1000_0000, 0)).unwrap();
        assert_eq!(
            table.declare(file_page(0x1000_0000, 5)).unwrap_err(),
            Error::AlreadyDeclared(0x1000_0000)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_requires_non_resident() {
        let mut table = SupplementalPageTable::new();
        table.declare(PageDescriptor::anonymous(VirtAddr(0xbfff_f000), FrameId(0))).unwrap();
        assert!(matches!(table.release(VirtAddr(0xbfff_f000)), Err(Error::Busy(_))));

        table.lookup_mut(VirtAddr(0xbfff_f000)).unwrap().mark_swapped(SwapSlot(4));
        let released = table.release(VirtAddr(0xbfff_f000)).unwrap();
        assert_eq!(released.swap_slot(), Some(SwapSlot(4)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_residency_transitions() {
        let mut page = file_page(0x0804_8000, PAGE_SIZE);
        page.mark_resident(FrameId(2));
        assert_eq!(page.frame(), Some(FrameId(2)));

        page.mark_swapped(SwapSlot(1));
        assert_eq!(page.kind(), BackingKind::Swap);
        assert!(page.file_backing().is_none());
        assert_eq!(page.swap_slot(), Some(SwapSlot(1)));

        page.mark_resident(FrameId(3));
        assert_eq!(page.swap_slot(), None);
        assert!(page.is_resident());
    }

    #[test]
    fn test_any_declared() {
        let mut table = SupplementalPageTable::new();
        table.declare(file_page(0x2000_2000, 0)).unwrap();
        assert!(table.any_declared(VirtAddr(0x2000_0000), 3));
        assert!(!table.any_declared(VirtAddr(0x2000_0000), 2));
    }

    #[test]
    fn test_registry_is_per_process() {
        let mut tables = PageTables::new();
        tables.table_mut(1).declare(file_page(0x0804_8000, 0)).unwrap();
        let owner = PageRef { pid: 1, page: VirtAddr(0x0804_8000) };

        assert!(tables.get(owner).is_some());
        assert!(tables.lookup(2, VirtAddr(0x0804_8000)).is_none());
        assert!(!tables.is_resident(owner));

        tables.get_mut(owner).unwrap().mark_resident(FrameId(0));
        assert!(tables.is_resident(owner));
        assert_eq!(tables.remove_process(1).map(|t| t.len()), Some(1));
    }
}
