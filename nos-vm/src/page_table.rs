//! Software page directory
//!
//! A per-process translation table from user pages to physical frames with
//! writable and dirty bits, implementing [`PageInstaller`]. It stands in for
//! the hardware page directory when the core runs hosted.

use hashbrown::HashMap;
use spin::Mutex;

use nos_api::{PageInstaller, Pid, RawPhysAddr, RawVirtAddr};

use crate::physical::page_round_down;

/// One installed translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Physical frame address
    pub frame: RawPhysAddr,
    /// Writes allowed
    pub writable: bool,
    /// Written since install or last clean
    pub dirty: bool,
}

/// Translation tables of every process, keyed by `(pid, page)`
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<HashMap<(Pid, RawVirtAddr), PageTableEntry>>,
    capacity: Option<usize>,
}

impl PageDirectory {
    /// Creates an unbounded directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory that refuses installs past `capacity` entries,
    /// modelling page-table exhaustion.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Returns the entry for the page containing `addr`.
    pub fn entry(&self, pid: Pid, addr: RawVirtAddr) -> Option<PageTableEntry> {
        self.entries.lock().get(&(pid, page_round_down(addr))).copied()
    }

    /// Number of translations installed for `pid`.
    pub fn mapped_pages(&self, pid: Pid) -> usize {
        self.entries.lock().keys().filter(|(owner, _)| *owner == pid).count()
    }

    /// Total number of translations installed.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageInstaller for PageDirectory {
    fn install(&self, pid: Pid, upage: RawVirtAddr, frame: RawPhysAddr, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&(pid, upage)) {
            return false;
        }
        if self.capacity.is_some_and(|cap| entries.len() >= cap) {
            return false;
        }
        entries.insert((pid, upage), PageTableEntry { frame, writable, dirty: false });
        true
    }

    fn uninstall(&self, pid: Pid, upage: RawVirtAddr) {
        self.entries.lock().remove(&(pid, upage));
    }

    fn translate(&self, pid: Pid, upage: RawVirtAddr) -> Option<RawPhysAddr> {
        self.entries.lock().get(&(pid, upage)).map(|entry| entry.frame)
    }

    fn is_dirty(&self, pid: Pid, upage: RawVirtAddr) -> bool {
        self.entries.lock().get(&(pid, upage)).is_some_and(|entry| entry.dirty)
    }

    fn set_dirty(&self, pid: Pid, upage: RawVirtAddr, dirty: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&(pid, upage)) {
            entry.dirty = dirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_translate_uninstall() {
        let dir = PageDirectory::new();
        assert!(dir.install(1, 0x1000, 0x8000, true));
        assert!(!dir.install(1, 0x1000, 0x9000, true));
        assert!(dir.install(2, 0x1000, 0x9000, false));

        assert_eq!(dir.translate(1, 0x1000), Some(0x8000));
        assert_eq!(dir.entry(2, 0x1fff).map(|e| e.writable), Some(false));
        assert_eq!(dir.mapped_pages(1), 1);

        dir.uninstall(1, 0x1000);
        assert_eq!(dir.translate(1, 0x1000), None);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_dirty_bit() {
        let dir = PageDirectory::new();
        dir.install(1, 0x2000, 0x3000, true);
        assert!(!dir.is_dirty(1, 0x2000));
        dir.set_dirty(1, 0x2000, true);
        assert!(dir.is_dirty(1, 0x2000));
        dir.set_dirty(1, 0x2000, false);
        assert!(!dir.is_dirty(1, 0x2000));
    }

    #[test]
    fn test_capacity_limit() {
        let dir = PageDirectory::with_capacity(1);
        assert!(dir.install(1, 0x1000, 0x8000, true));
        assert!(!dir.install(1, 0x2000, 0x9000, true));
    }
}
