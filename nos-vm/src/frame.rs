//! Frame table
//!
//! Global registry of every physical frame currently serving a user page.
//! Registration order is kept in a FIFO queue; eviction always picks the
//! oldest registered frame whose page is still resident. This is plain
//! FIFO over all processes, not an approximation of LRU.
//!
//! The registry lock is only held for bookkeeping. Writing a victim out to
//! swap or to its file happens after the victim has been taken off the
//! registry, with the lock released.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use nos_api::error::{Result, out_of_memory};

use crate::page::PageRef;
use crate::physical::{AllocFlags, FrameBytes, FrameId, PhysicalMemory};

/// A registered frame and the page it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Physical frame
    pub frame: FrameId,
    /// Page currently held by the frame
    pub owner: PageRef,
}

/// Bookkeeping half of the frame table.
#[derive(Debug, Default)]
pub struct FrameRegistry {
    owners: HashMap<FrameId, PageRef>,
    order: VecDeque<FrameId>,
}

impl FrameRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `frame` as the newest frame, serving `owner`.
    pub fn register(&mut self, frame: FrameId, owner: PageRef) -> Result<()> {
        self.owners.try_reserve(1).map_err(|_| out_of_memory())?;
        self.order.try_reserve(1).map_err(|_| out_of_memory())?;
        if self.owners.insert(frame, owner).is_some() {
            self.order.retain(|&f| f != frame);
        }
        self.order.push_back(frame);
        Ok(())
    }

    /// Forgets `frame`, returning the page it served.
    pub fn unregister(&mut self, frame: FrameId) -> Option<PageRef> {
        let owner = self.owners.remove(&frame)?;
        self.order.retain(|&f| f != frame);
        Some(owner)
    }

    /// Page served by `frame`.
    pub fn owner(&self, frame: FrameId) -> Option<PageRef> {
        self.owners.get(&frame).copied()
    }

    /// Takes the oldest frame whose page `is_resident` off the registry.
    ///
    /// Frames whose page is not resident yet (a load in progress) are
    /// skipped and keep their place in the queue.
    pub fn select_victim(
        &mut self,
        mut is_resident: impl FnMut(PageRef) -> bool,
    ) -> Option<FrameDescriptor> {
        let position = self.order.iter().position(|frame| {
            self.owners.get(frame).is_some_and(|&owner| is_resident(owner))
        })?;
        let frame = self.order.remove(position)?;
        let owner = self.owners.remove(&frame)?;
        Some(FrameDescriptor { frame, owner })
    }

    /// Puts a victim whose write-out failed back at the tail of the queue,
    /// behind every frame still worth trying.
    pub fn requeue(&mut self, victim: FrameDescriptor) {
        self.owners.insert(victim.frame, victim.owner);
        self.order.push_back(victim.frame);
    }

    /// Registered frames, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = FrameDescriptor> + '_ {
        self.order.iter().filter_map(|&frame| {
            self.owners.get(&frame).map(|&owner| FrameDescriptor { frame, owner })
        })
    }

    /// Number of registered frames.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// True if no frame is registered.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Physical frame pool plus the registry of frames in use.
pub struct FrameTable {
    memory: PhysicalMemory,
    registry: Mutex<FrameRegistry>,
}

impl FrameTable {
    /// Creates a table over a pool of `budget` frames.
    pub fn new(budget: usize) -> Self {
        Self {
            memory: PhysicalMemory::new(budget),
            registry: Mutex::new(FrameRegistry::new()),
        }
    }

    /// Allocates a frame for `owner` and registers it.
    ///
    /// Returns `Ok(None)` when the pool is empty; the caller evicts and
    /// tries again.
    pub fn try_acquire(&self, flags: AllocFlags, owner: PageRef) -> Result<Option<FrameId>> {
        let mut registry = self.registry.lock();
        let Some(frame) = self.memory.allocate(flags) else {
            return Ok(None);
        };
        if let Err(err) = registry.register(frame, owner) {
            self.memory.free(frame);
            return Err(err);
        }
        vm_trace!("frame: {:?} -> pid {} page {}", frame, owner.pid, owner.page);
        Ok(Some(frame))
    }

    /// Unregisters `frame` and returns it to the pool.
    ///
    /// A frame that is not registered is left alone, so releasing twice
    /// never puts a frame on the free list twice.
    pub fn release(&self, frame: FrameId) {
        let mut registry = self.registry.lock();
        if registry.unregister(frame).is_none() {
            vm_warn!("frame: release of unregistered {:?}", frame);
            return;
        }
        self.memory.free(frame);
    }

    /// Takes the eviction victim off the registry. See
    /// [`FrameRegistry::select_victim`].
    pub fn select_victim(&self, is_resident: impl FnMut(PageRef) -> bool) -> Option<FrameDescriptor> {
        self.registry.lock().select_victim(is_resident)
    }

    /// Returns a victim whose write-out failed to the tail of the queue.
    pub fn requeue(&self, victim: FrameDescriptor) {
        self.registry.lock().requeue(victim);
    }

    /// Returns the frame of an evicted victim to the pool.
    pub(crate) fn free_evicted(&self, frame: FrameId) {
        self.memory.free(frame);
    }

    /// Locks and returns the bytes of `frame`.
    pub fn bytes(&self, frame: FrameId) -> FrameBytes<'_> {
        self.memory.bytes(frame)
    }

    /// Page served by `frame`.
    pub fn owner(&self, frame: FrameId) -> Option<PageRef> {
        self.registry.lock().owner(frame)
    }

    /// Snapshot of registered frames, oldest first.
    pub fn registered(&self) -> Vec<FrameDescriptor> {
        self.registry.lock().iter().collect()
    }

    /// Number of frames in use.
    pub fn resident(&self) -> usize {
        self.registry.lock().len()
    }

    /// Number of frames still free in the pool.
    pub fn free_frames(&self) -> usize {
        self.memory.free_frames()
    }

    /// Total number of frames.
    pub fn budget(&self) -> usize {
        self.memory.budget()
    }
}
