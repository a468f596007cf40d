//! Swap store
//!
//! A slot-addressed region of the swap block device. Each slot holds exactly
//! one page, i.e. `SECTORS_PER_PAGE` consecutive sectors starting at
//! `slot * SECTORS_PER_PAGE`. Occupancy lives in a bitmap that is the only
//! source of truth: a slot is set while it holds the content of exactly one
//! non-resident page and is cleared the moment that content is read back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use nos_api::error::{Error, Result, invalid_argument};
use nos_api::{BLOCK_SECTOR_SIZE, BlockDevice};

use crate::physical::PAGE_SIZE;

/// Number of device sectors backing one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SECTOR_SIZE;

/// Index of one page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// First device sector of the slot.
    pub const fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

/// Fixed-size occupancy bitmap, one bit per slot.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl SlotBitmap {
    /// Creates a bitmap of `len` free slots.
    pub fn new(len: usize) -> Self {
        Self {
            words: alloc::vec![0; len.div_ceil(64)],
            len,
            used: 0,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the bitmap has no slots at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of occupied slots.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns whether `index` is occupied.
    pub fn test(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Finds the first free slot, marks it occupied and returns it.
    pub fn scan_and_set(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = word_idx * 64 + bit;
            if index >= self.len {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(index);
        }
        None
    }

    /// Marks `index` free. Returns false if it was not occupied.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.test(index) {
            return false;
        }
        self.words[index / 64] &= !(1 << (index % 64));
        self.used -= 1;
        true
    }
}

struct SwapInner {
    device: Arc<dyn BlockDevice>,
    bitmap: SlotBitmap,
}

/// Disk-backed storage for evicted anonymous pages.
pub struct SwapStore {
    inner: Mutex<SwapInner>,
}

impl SwapStore {
    /// Creates a swap store spanning every whole slot of `device`.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / SECTORS_PER_PAGE;
        vm_info!("swap: {} slots of {} sectors", slots, SECTORS_PER_PAGE);
        Self {
            inner: Mutex::new(SwapInner {
                device,
                bitmap: SlotBitmap::new(slots),
            }),
        }
    }

    /// Persists one page to the first free slot and returns the slot.
    ///
    /// Fails with [`Error::OutOfSwap`] when every slot is occupied. On a
    /// device error the slot is released again.
    pub fn write(&self, page: &[u8]) -> Result<SwapSlot> {
        if page.len() != PAGE_SIZE {
            return Err(invalid_argument("swap transfers are exactly one page"));
        }
        let mut inner = self.inner.lock();
        let slot = SwapSlot(inner.bitmap.scan_and_set().ok_or(Error::OutOfSwap)?);

        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = inner.device.write_sector(slot.first_sector() + i, chunk) {
                inner.bitmap.clear(slot.0);
                return Err(err);
            }
        }
        vm_trace!("swap: wrote slot {}", slot.0);
        Ok(slot)
    }

    /// Copies `slot` back into `page` and frees the slot.
    pub fn read(&self, page: &mut [u8], slot: SwapSlot) -> Result<()> {
        if page.len() != PAGE_SIZE {
            return Err(invalid_argument("swap transfers are exactly one page"));
        }
        let mut inner = self.inner.lock();
        if !inner.bitmap.test(slot.0) {
            return Err(invalid_argument("swap slot is not occupied"));
        }
        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            inner.device.read_sector(slot.first_sector() + i, chunk)?;
        }
        inner.bitmap.clear(slot.0);
        vm_trace!("swap: read back slot {}", slot.0);
        Ok(())
    }

    /// Discards the content of `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        if !self.inner.lock().bitmap.clear(slot.0) {
            vm_warn!("swap: free of unoccupied slot {}", slot.0);
        }
    }

    /// Returns whether `slot` currently holds page content.
    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        self.inner.lock().bitmap.test(slot.0)
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.lock().bitmap.len()
    }

    /// Number of occupied slots.
    pub fn used(&self) -> usize {
        self.inner.lock().bitmap.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RamDisk;

    fn store(slots: usize) -> SwapStore {
        SwapStore::new(Arc::new(RamDisk::new(slots * SECTORS_PER_PAGE)))
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_bitmap_scan_and_clear() {
        let mut bitmap = SlotBitmap::new(70);
        for expected in 0..70 {
            assert_eq!(bitmap.scan_and_set(), Some(expected));
        }
        assert_eq!(bitmap.scan_and_set(), None);
        assert_eq!(bitmap.used(), 70);

        assert!(bitmap.clear(65));
        assert!(!bitmap.clear(65));
        assert_eq!(bitmap.scan_and_set(), Some(65));
    }

    #[test]
    fn test_slot_geometry() {
        assert_eq!(SECTORS_PER_PAGE, 8);
        assert_eq!(SwapSlot(3).first_sector(), 24);
        assert_eq!(store(4).capacity(), 4);
    }

    #[test]
    fn test_write_read_frees_slot() {
        let swap = store(2);
        let page = pattern(7);

        let slot = swap.write(&page).unwrap();
        assert!(swap.is_occupied(slot));
        assert_eq!(swap.used(), 1);

        let mut back = alloc::vec![0u8; PAGE_SIZE];
        swap.read(&mut back, slot).unwrap();
        assert_eq!(back, page);
        assert!(!swap.is_occupied(slot));
        assert_eq!(swap.used(), 0);

        // A second read of the same slot is a contract violation.
        assert!(swap.read(&mut back, slot).is_err());
    }

    #[test]
    fn test_slots_are_not_aliased() {
        let swap = store(3);
        let a = swap.write(&pattern(1)).unwrap();
        let b = swap.write(&pattern(2)).unwrap();
        assert_ne!(a, b);

        let mut back = alloc::vec![0u8; PAGE_SIZE];
        swap.read(&mut back, a).unwrap();
        assert_eq!(back, pattern(1));

        // The freed slot is reused first.
        let c = swap.write(&pattern(3)).unwrap();
        assert_eq!(c, a);
        swap.read(&mut back, b).unwrap();
        assert_eq!(back, pattern(2));
    }

    #[test]
    fn test_exhaustion() {
        let swap = store(1);
        swap.write(&pattern(0)).unwrap();
        assert_eq!(swap.write(&pattern(1)), Err(Error::OutOfSwap));

        swap.free(SwapSlot(0));
        assert!(swap.write(&pattern(1)).is_ok());
    }
}
