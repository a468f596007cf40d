//! Physical memory: frame identities and the user frame pool
//!
//! The pool plays the role of the kernel's page allocator for user pages.
//! It owns a fixed budget of frames; the frame table decides which virtual
//! page each allocated frame serves.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use nos_api::BLOCK_SECTOR_SIZE;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const_assert!(PAGE_SIZE % BLOCK_SECTOR_SIZE == 0);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Physical address to page number
#[inline]
pub const fn addr_to_pfn(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// Page number to physical address
#[inline]
pub const fn pfn_to_addr(pfn: usize) -> usize {
    pfn << PAGE_SHIFT
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current frame.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

/// Identity of one physical frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Physical address of the first byte of the frame.
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr(pfn_to_addr(self.0))
    }

    /// Frame containing `addr`.
    pub const fn containing(addr: PhysAddr) -> Self {
        Self(addr_to_pfn(addr.0))
    }
}

bitflags! {
    /// Flags for a frame request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Frame for a user page
        const USER = 1 << 0;
        /// Zero the frame before handing it out
        const ZERO = 1 << 1;
    }
}

/// A frame's backing bytes, locked for the duration of the borrow.
pub type FrameBytes<'a> = MutexGuard<'a, Box<[u8]>>;

/// Fixed-budget pool of user frames.
pub struct PhysicalMemory {
    frames: Vec<Mutex<Box<[u8]>>>,
    free_list: Mutex<Vec<FrameId>>,
}

impl PhysicalMemory {
    /// Creates a pool of `budget` zeroed frames.
    pub fn new(budget: usize) -> Self {
        let frames = (0..budget)
            .map(|_| Mutex::new(alloc::vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        // Lowest frame numbers are handed out first.
        let free_list = (0..budget).rev().map(FrameId).collect();
        Self {
            frames,
            free_list: Mutex::new(free_list),
        }
    }

    /// Takes a free frame, or returns `None` when the budget is exhausted.
    pub fn allocate(&self, flags: AllocFlags) -> Option<FrameId> {
        let frame = self.free_list.lock().pop()?;
        if flags.contains(AllocFlags::ZERO) {
            self.bytes(frame).fill(0);
        }
        Some(frame)
    }

    /// Returns `frame` to the pool.
    pub fn free(&self, frame: FrameId) {
        let mut free_list = self.free_list.lock();
        debug_assert!(!free_list.contains(&frame), "double free of {:?}", frame);
        free_list.push(frame);
    }

    /// Locks and returns the bytes of `frame`.
    ///
    /// # Panics
    /// Panics if `frame` does not belong to this pool.
    pub fn bytes(&self, frame: FrameId) -> FrameBytes<'_> {
        self.frames[frame.0].lock()
    }

    /// Total number of frames in the pool.
    pub fn budget(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free_list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_up(0x1234), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert_eq!(pfn_to_addr(addr_to_pfn(0x5fff)), 0x5000);
    }

    #[test]
    fn test_frame_addresses() {
        let frame = FrameId(3);
        assert_eq!(frame.start_address(), PhysAddr(3 * PAGE_SIZE));
        assert_eq!(FrameId::containing(PhysAddr(3 * PAGE_SIZE + 17)), frame);
        assert_eq!(PhysAddr(3 * PAGE_SIZE + 17).page_offset(), 17);
    }

    #[test]
    fn test_budget_exhaustion() {
        let memory = PhysicalMemory::new(2);
        let a = memory.allocate(AllocFlags::USER).unwrap();
        let b = memory.allocate(AllocFlags::USER).unwrap();
        assert_ne!(a, b);
        assert!(memory.allocate(AllocFlags::USER).is_none());

        memory.free(a);
        assert_eq!(memory.free_frames(), 1);
        assert_eq!(memory.allocate(AllocFlags::USER), Some(a));
    }

    #[test]
    fn test_zeroed_allocation() {
        let memory = PhysicalMemory::new(1);
        let frame = memory.allocate(AllocFlags::USER).unwrap();
        memory.bytes(frame).fill(0xAB);
        memory.free(frame);

        let dirty = memory.allocate(AllocFlags::USER).unwrap();
        assert_eq!(memory.bytes(dirty)[0], 0xAB);
        memory.free(dirty);

        let clean = memory.allocate(AllocFlags::USER | AllocFlags::ZERO).unwrap();
        assert!(memory.bytes(clean).iter().all(|&b| b == 0));
    }
}
