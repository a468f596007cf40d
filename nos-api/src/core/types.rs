//! Core types used throughout the NOS virtual memory subsystem

/// Process identifier type
pub type Pid = u32;

/// File descriptor type
pub type Fd = i32;

/// Memory mapping identifier returned by `mmap`
pub type MapId = i32;

/// Raw virtual address as seen by a collaborator
pub type RawVirtAddr = usize;

/// Raw physical address as seen by a collaborator
pub type RawPhysAddr = usize;

/// Standard input descriptor; never mappable.
pub const STDIN_FILENO: Fd = 0;

/// Standard output descriptor; never mappable.
pub const STDOUT_FILENO: Fd = 1;

/// Exit status reported for a process killed by the kernel.
pub const EXIT_FAILURE: i32 = -1;

/// Value returned to user space by a rejected `mmap`.
pub const MAP_FAILED: MapId = -1;

/// Size of one block device sector in bytes.
pub const BLOCK_SECTOR_SIZE: usize = 512;
