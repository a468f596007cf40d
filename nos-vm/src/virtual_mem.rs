//! Virtual addresses

use core::fmt;

use crate::physical::{PAGE_SIZE, PAGE_SHIFT, page_round_up, page_round_down};

/// A user virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Checks if this is the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Address `pages` pages above this one, or `None` on overflow.
    pub fn checked_add_pages(self, pages: usize) -> Option<Self> {
        pages
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }

    /// Address `bytes` above this one, or `None` on overflow.
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_arithmetic() {
        let addr = VirtAddr::new(0x0804_8123);
        assert_eq!(addr.page_round_down(), VirtAddr(0x0804_8000));
        assert_eq!(addr.page_round_up(), VirtAddr(0x0804_9000));
        assert_eq!(addr.page_offset(), 0x123);
        assert!(!addr.is_page_aligned());
        assert!(addr.page_round_down().is_page_aligned());
        assert_eq!(VirtAddr(0x1000).checked_add_pages(2), Some(VirtAddr(0x3000)));
        assert_eq!(VirtAddr(usize::MAX).checked_add_pages(1), None);
    }
}
