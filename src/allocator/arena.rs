//! Arena blocks - large OS regions carved by a bump cursor
//!
//! Design: one mapping per block (2MB by default), optionally on huge pages
//! and bound to a NUMA node. Individual allocations are never released; the
//! block is rewound or unmapped as a whole.

use super::bump::BumpCursor;
use crate::numa::NodeId;
use crate::os::Mapping;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default block size, one huge page
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// How a new block should be placed
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockPlacement {
    pub node: Option<NodeId>,
    pub huge_pages: bool,
    pub prefault: bool,
}

/// One contiguous region with a bump cursor
///
/// Invariant: `start <= start + cursor <= end`, cursor never decreases
/// except through [`ArenaBlock::rewind`].
#[derive(Debug)]
pub struct ArenaBlock {
    mapping: Mapping,
    cursor: BumpCursor,
    node: Option<NodeId>,
    allocations: AtomicU64,
}

impl ArenaBlock {
    /// Map a block of at least `size` bytes
    pub fn new(size: usize, placement: BlockPlacement) -> Option<Self> {
        let mapping = if placement.huge_pages {
            Mapping::anonymous_prefer_huge(size)?
        } else {
            Mapping::anonymous(size, false)?
        };

        let node = placement.node.filter(|&n| mapping.bind_to_node(n));
        if placement.prefault {
            mapping.prefault();
        }

        debug!(
            event = "arena_block_mapped",
            size_bytes = mapping.len(),
            huge_pages = mapping.is_huge(),
            node = ?node,
            "Arena block mapped"
        );

        Some(Self {
            cursor: BumpCursor::new(mapping.len()),
            mapping,
            node,
            allocations: AtomicU64::new(0),
        })
    }

    /// Bump `size` bytes (already rounded by the caller)
    #[inline]
    pub fn try_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let offset = self.cursor.try_bump(size)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        // SAFETY: offset + size <= mapping.len()
        NonNull::new(unsafe { self.mapping.as_ptr().add(offset) })
    }

    pub(crate) fn rewind(&self) {
        self.cursor.rewind();
        self.allocations.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.mapping.start()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.mapping.end()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mapping.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.cursor.used()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    #[inline]
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    #[inline]
    pub fn is_huge(&self) -> bool {
        self.mapping.is_huge()
    }

    #[inline]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.mapping.contains(addr)
    }

    /// Cursor lies within the block
    pub fn is_consistent(&self) -> bool {
        let cursor = self.start() + self.used();
        self.start() <= cursor && cursor <= self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_bump_stays_in_bounds() {
        let block = ArenaBlock::new(4096, BlockPlacement::default()).unwrap();
        let a = block.try_alloc(1024).unwrap().as_ptr() as usize;
        let b = block.try_alloc(1024).unwrap().as_ptr() as usize;
        assert_eq!(a, block.start());
        assert_eq!(b, a + 1024);
        assert!(block.contains(b));
        assert!(block.is_consistent());
        assert_eq!(block.allocations(), 2);
    }

    #[test]
    fn test_block_rewind() {
        let block = ArenaBlock::new(4096, BlockPlacement::default()).unwrap();
        let first = block.try_alloc(block.capacity()).unwrap();
        assert!(block.try_alloc(64).is_none());
        block.rewind();
        assert_eq!(block.try_alloc(64).unwrap(), first);
    }
}
