//! Thread arenas - a chain of arena blocks owned by one thread
//!
//! The hot path is a single CAS bump on the current block. The block chain
//! is only touched when the current block runs dry, under a try-lock that is
//! abandoned after a bounded number of attempts.

use super::arena::{ArenaBlock, BlockPlacement};
use crate::numa::NodeId;
use crate::os::{align_up, CACHE_LINE_SIZE};
use crate::sync::{retry_bounded, Attempt};
use parking_lot::Mutex;
use serde::Serialize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Try-lock attempts before a grow gives up
const GROW_LOCK_BUDGET: u32 = 32;

/// Per-arena counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThreadArenaStats {
    pub blocks: usize,
    pub reserved_bytes: usize,
    pub used_bytes: usize,
    /// Unused tails of blocks that are no longer current
    pub wasted_bytes: usize,
    pub allocations: u64,
    pub bytes_requested: u64,
    pub grow_contention: u64,
}

/// Bump arena for one thread
pub struct ThreadArena {
    /// Every block ever mapped, in creation order. Boxes keep block
    /// addresses stable while `current` points at one of them.
    blocks: Mutex<Vec<Box<ArenaBlock>>>,
    current: AtomicPtr<ArenaBlock>,
    block_size: usize,
    placement: BlockPlacement,
    allocations: AtomicU64,
    bytes_requested: AtomicU64,
    grow_contention: AtomicU64,
}

// SAFETY: `current` only ever points into a Box owned by `blocks`, which
// lives as long as the arena
unsafe impl Send for ThreadArena {}
unsafe impl Sync for ThreadArena {}

impl ThreadArena {
    /// Create an arena with one block of `block_size` bytes
    pub fn new(block_size: usize, placement: BlockPlacement) -> Option<Self> {
        let mut first = Box::new(ArenaBlock::new(block_size, placement)?);
        let current: *mut ArenaBlock = &mut *first;
        Some(Self {
            blocks: Mutex::new(vec![first]),
            current: AtomicPtr::new(current),
            block_size,
            placement,
            allocations: AtomicU64::new(0),
            bytes_requested: AtomicU64::new(0),
            grow_contention: AtomicU64::new(0),
        })
    }

    /// Allocate `size` bytes rounded up to a cache line.
    ///
    /// Returns `None` for zero-sized requests or when the OS refuses a new
    /// block.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let rounded = align_up(size, CACHE_LINE_SIZE)?;

        // SAFETY: current is never null and its block outlives self
        let block = unsafe { &*self.current.load(Ordering::Acquire) };
        let ptr = match block.try_alloc(rounded) {
            Some(ptr) => ptr,
            None => self.grow(rounded)?,
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_requested
            .fetch_add(size as u64, Ordering::Relaxed);
        trace!(event = "arena_alloc", size_bytes = size, address = ?ptr.as_ptr());
        Some(ptr)
    }

    /// Slow path: switch to a block with room, mapping one if needed
    #[cold]
    fn grow(&self, size: usize) -> Option<NonNull<u8>> {
        let guard = retry_bounded(GROW_LOCK_BUDGET, || match self.blocks.try_lock() {
            Some(guard) => Attempt::Won(guard),
            None => Attempt::Lost,
        });
        let mut blocks = match guard {
            Some(guard) => guard,
            None => {
                self.grow_contention.fetch_add(1, Ordering::Relaxed);
                debug!(event = "arena_grow_contended", size_bytes = size, "Arena grow skipped");
                return None;
            }
        };

        // Someone grew while we waited
        let current = self.current.load(Ordering::Acquire);
        // SAFETY: current is never null
        if let Some(ptr) = unsafe { (*current).try_alloc(size) } {
            return Some(ptr);
        }

        // A rewound block may still have room
        let reusable = blocks
            .iter()
            .map(|b| &**b as *const ArenaBlock as *mut ArenaBlock)
            .filter(|&b| b != current)
            // SAFETY: pointers come from live boxes held under the lock
            .find(|&b| unsafe { (*b).remaining() } >= size);
        if let Some(block) = reusable {
            self.current.store(block, Ordering::Release);
            // SAFETY: block is a live box held under the lock
            return unsafe { (*block).try_alloc(size) };
        }

        let block_size = if size > self.block_size {
            size.max(self.block_size.saturating_mul(2))
        } else {
            self.block_size
        };
        let mut block = Box::new(ArenaBlock::new(block_size, self.placement)?);
        let ptr = block.try_alloc(size);
        let raw: *mut ArenaBlock = &mut *block;
        blocks.push(block);
        self.current.store(raw, Ordering::Release);
        ptr
    }

    /// Rewind every block, keeping the memory mapped.
    ///
    /// Callers must guarantee no allocation is in flight and no pointer
    /// handed out earlier is used again.
    pub(crate) fn rewind(&self) {
        let blocks = self.blocks.lock();
        for block in blocks.iter() {
            block.rewind();
        }
        if let Some(first) = blocks.first() {
            self.current
                .store(&**first as *const ArenaBlock as *mut ArenaBlock, Ordering::Release);
        }
    }

    #[inline]
    pub fn preferred_node(&self) -> Option<NodeId> {
        self.placement.node
    }

    /// Whether `addr` lies in one of this arena's blocks
    pub fn contains(&self, addr: usize) -> bool {
        self.blocks.lock().iter().any(|b| b.contains(addr))
    }

    /// Every block's cursor is in bounds
    pub fn check_integrity(&self) -> bool {
        self.blocks.lock().iter().all(|b| b.is_consistent())
    }

    pub fn stats(&self) -> ThreadArenaStats {
        let blocks = self.blocks.lock();
        let current = self.current.load(Ordering::Acquire) as *const ArenaBlock;
        let mut stats = ThreadArenaStats {
            blocks: blocks.len(),
            allocations: self.allocations.load(Ordering::Relaxed),
            bytes_requested: self.bytes_requested.load(Ordering::Relaxed),
            grow_contention: self.grow_contention.load(Ordering::Relaxed),
            ..ThreadArenaStats::default()
        };
        for block in blocks.iter() {
            stats.reserved_bytes += block.capacity();
            stats.used_bytes += block.used();
            if !ptr::eq(&**block, current) && block.used() > 0 {
                stats.wasted_bytes += block.remaining();
            }
        }
        stats
    }
}
