//! User address space layout
//!
//! Centralizes the constants that decide which user addresses are legal and
//! how far the stack may grow. The defaults follow the classic 32-bit x86
//! user layout: code starts at 0x0804_8000 and user space ends at
//! 0xC000_0000, with the stack growing down from there.
//!
//! ## Stack growth rule
//!
//! An access with no declared page is a stack-growth candidate when it is at
//! most `stack_push_margin` bytes below the stack pointer (a `PUSH` or
//! `PUSHA` touches memory below `esp` before `esp` moves) and the containing
//! page lies no more than `stack_limit` bytes below `user_top`.

use nos_api::error::{Result, config_error};

use crate::physical::PAGE_SIZE;
use crate::virtual_mem::VirtAddr;

/// Lowest legal user address (start of the code segment).
pub const USER_BASE: usize = 0x0804_8000;

/// End of user space, exclusive. The stack grows down from here.
pub const USER_TOP: usize = 0xC000_0000;

/// Absolute ceiling on stack size (8 MiB).
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// Bytes below the stack pointer an access may touch and still count as a
/// push (`PUSHA` stores 32 bytes).
pub const STACK_PUSH_MARGIN: usize = 32;

/// User address space layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    /// Lowest legal user address
    pub user_base: usize,

    /// End of user space (exclusive); top of the stack
    pub user_top: usize,

    /// Maximum stack size in bytes
    pub stack_limit: usize,

    /// Accesses up to this many bytes below the stack pointer may grow the stack
    pub stack_push_margin: usize,

    /// Page size in bytes
    pub page_size: usize,
}

impl Default for AddressSpaceLayout {
    fn default() -> Self {
        Self {
            user_base: USER_BASE,
            user_top: USER_TOP,
            stack_limit: STACK_LIMIT,
            stack_push_margin: STACK_PUSH_MARGIN,
            page_size: PAGE_SIZE,
        }
    }
}

impl AddressSpaceLayout {
    /// Check if an address is in user space
    #[inline]
    pub fn is_user_address(&self, addr: VirtAddr) -> bool {
        addr.0 >= self.user_base && addr.0 < self.user_top
    }

    /// Check if every byte of `[addr, addr + len)` is in user space
    pub fn is_user_range(&self, addr: VirtAddr, len: usize) -> bool {
        if len == 0 {
            return self.is_user_address(addr);
        }
        match addr.0.checked_add(len - 1) {
            Some(last) => self.is_user_address(addr) && self.is_user_address(VirtAddr(last)),
            None => false,
        }
    }

    /// Lowest page the stack may ever occupy
    #[inline]
    pub fn stack_floor(&self) -> VirtAddr {
        VirtAddr(self.user_top - self.stack_limit)
    }

    /// Decides whether an undeclared access at `addr` may grow the stack
    /// given the current stack pointer `sp`.
    pub fn is_stack_growth(&self, addr: VirtAddr, sp: VirtAddr) -> bool {
        if !self.is_user_address(addr) {
            return false;
        }
        let near_sp = addr.0.saturating_add(self.stack_push_margin) >= sp.0;
        let page = addr.page_round_down();
        let within_limit = self.user_top - page.0 <= self.stack_limit;
        near_sp && within_limit
    }

    /// Verify the layout is internally consistent
    pub fn verify(&self) -> Result<()> {
        if self.page_size != PAGE_SIZE {
            return Err(config_error("page size must match the frame size"));
        }
        if self.user_base >= self.user_top {
            return Err(config_error("user base must lie below user top"));
        }
        if self.user_base % self.page_size != 0 || self.user_top % self.page_size != 0 {
            return Err(config_error("user space bounds must be page-aligned"));
        }
        if self.stack_limit == 0 || self.stack_limit % self.page_size != 0 {
            return Err(config_error("stack limit must be a non-zero page multiple"));
        }
        if self.stack_limit > self.user_top - self.user_base {
            return Err(config_error("stack limit exceeds user space"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_checks() {
        let layout = AddressSpaceLayout::default();

        assert!(layout.is_user_address(VirtAddr(USER_BASE)));
        assert!(layout.is_user_address(VirtAddr(USER_TOP - 1)));
        assert!(!layout.is_user_address(VirtAddr(USER_TOP)));
        assert!(!layout.is_user_address(VirtAddr(0)));
        assert!(!layout.is_user_address(VirtAddr(USER_BASE - 1)));

        assert!(layout.is_user_range(VirtAddr(USER_TOP - 8), 8));
        assert!(!layout.is_user_range(VirtAddr(USER_TOP - 8), 9));
        assert!(!layout.is_user_range(VirtAddr(usize::MAX), 2));
    }

    #[test]
    fn test_stack_growth_margin() {
        let layout = AddressSpaceLayout::default();
        let sp = VirtAddr(USER_TOP - 0x100);

        assert!(layout.is_stack_growth(VirtAddr(sp.0 - 4), sp));
        assert!(layout.is_stack_growth(VirtAddr(sp.0 - 32), sp));
        assert!(!layout.is_stack_growth(VirtAddr(sp.0 - 33), sp));
        // Above the stack pointer is always a candidate.
        assert!(layout.is_stack_growth(VirtAddr(sp.0 + 8), sp));
    }

    #[test]
    fn test_stack_growth_ceiling() {
        let layout = AddressSpaceLayout::default();
        let floor = layout.stack_floor();

        assert!(layout.is_stack_growth(floor, VirtAddr(floor.0 + 4)));
        let beyond = VirtAddr(floor.0 - PAGE_SIZE);
        assert!(!layout.is_stack_growth(beyond, VirtAddr(beyond.0 + 4)));
    }

    #[test]
    fn test_layout_verification() {
        assert!(AddressSpaceLayout::default().verify().is_ok());

        let inverted = AddressSpaceLayout {
            user_base: USER_TOP,
            user_top: USER_BASE,
            ..AddressSpaceLayout::default()
        };
        assert!(inverted.verify().is_err());

        let ragged = AddressSpaceLayout {
            stack_limit: 1000,
            ..AddressSpaceLayout::default()
        };
        assert!(ragged.verify().is_err());
    }
}
