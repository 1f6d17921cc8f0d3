//! Memory allocator - tiered, NUMA-aware allocation
//!
//! Design: Three paths chosen by request size:
//! 1. Slab (small objects, lock-free size-classed free lists)
//! 2. Thread arena (medium objects, lock-free bump in per-thread blocks)
//! 3. Large-object tracker (one mapping per object, freed by address)
//!
//! Arena memory is released in bulk through [`Allocator::reset`] or drop.

mod arena;
mod bump;
mod large;
mod size_class;
mod slab;
mod stats;
mod thread_arena;

#[cfg(test)]
mod tests;

pub use arena::{ArenaBlock, BlockPlacement, DEFAULT_BLOCK_SIZE};
pub use bump::BumpCursor;
pub use large::{LargeObjectRecord, LargeObjectStats, LargeObjectTracker, NodeUsage, LARGE_OBJECT_THRESHOLD};
pub use size_class::{
    objects_per_slab, SizeClassLadder, SizeClasses, FINE_CLASSES, MIN_OBJECTS_PER_SLAB,
    STANDARD_CLASSES,
};
pub use slab::{SlabAllocation, SlabAllocator, SlabClassStats, SlabStats};
pub use stats::AllocatorStats;
pub use thread_arena::{ThreadArena, ThreadArenaStats};

use crate::config::MemoryConfig;
use crate::error::{ConfigError, FreeError};
use crate::numa::{self, NodeId, Topology};
use crate::os::{align_up, page_size, CACHE_LINE_SIZE};
use dashmap::DashMap;
use stats::Counters;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Path a request of a given size takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Slab,
    Arena,
    Large,
}

/// Tiered allocator shared by every worker thread
pub struct Allocator {
    block_size: usize,
    large_threshold: usize,
    numa_aware: bool,
    placement: BlockPlacement,
    topology: Arc<Topology>,
    slab: SlabAllocator,
    large: LargeObjectTracker,
    arenas: DashMap<(ThreadId, NodeId), Arc<ThreadArena>>,
    counters: Counters,
}

impl Allocator {
    /// Build against the process topology
    pub fn new(config: &MemoryConfig) -> Result<Self, ConfigError> {
        Self::with_topology(config, numa::detect())
    }

    /// Build against an explicit topology
    pub fn with_topology(config: &MemoryConfig, topology: Arc<Topology>) -> Result<Self, ConfigError> {
        config.validate()?;
        let classes = SizeClasses::new(&config.size_classes)?;

        let numa_aware = config.numa_aware && topology.is_available();
        Ok(Self {
            block_size: config.default_block_size,
            large_threshold: config.large_object_threshold,
            numa_aware,
            placement: BlockPlacement {
                node: None,
                huge_pages: config.huge_pages,
                prefault: config.prefault,
            },
            slab: SlabAllocator::new(
                classes,
                Arc::clone(&topology),
                numa_aware,
                config.slab_retry_budget,
            ),
            large: LargeObjectTracker::new(topology.node_count(), config.huge_pages),
            topology,
            arenas: DashMap::new(),
            counters: Counters::default(),
        })
    }

    /// Which path serves `size`
    #[inline]
    pub fn route(&self, size: usize) -> Route {
        if size >= self.large_threshold {
            Route::Large
        } else if size <= self.slab.max_object_size() {
            Route::Slab
        } else {
            Route::Arena
        }
    }

    #[inline]
    fn current_node(&self) -> NodeId {
        if self.numa_aware {
            self.topology.current_node()
        } else {
            NodeId::ZERO
        }
    }

    /// Arena for the calling thread on `node`, created on first use
    fn arena_for(&self, node: NodeId) -> Option<Arc<ThreadArena>> {
        let key = (thread::current().id(), node);
        if let Some(arena) = self.arenas.get(&key) {
            return Some(Arc::clone(arena.value()));
        }

        let placement = BlockPlacement {
            node: self.numa_aware.then_some(node),
            ..self.placement
        };
        let arena = Arc::new(ThreadArena::new(self.block_size, placement)?);
        self.arenas.insert(key, Arc::clone(&arena));
        Some(arena)
    }

    /// Allocate `size` bytes from whichever path fits.
    ///
    /// Returns `None` for zero-sized requests and when the OS refuses memory.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let node = self.current_node();
        self.allocate_routed(size, node, None)
    }

    /// Allocate with placement on `node`. Each path serves the sizes it
    /// always serves: slab objects come from that node's free lists, medium
    /// requests from the calling thread's arena for the node, and large
    /// mappings are bound to it.
    pub fn allocate_on_node(&self, size: usize, node: NodeId) -> Option<NonNull<u8>> {
        if !self.topology.contains(node) {
            return self.allocate(size);
        }
        if size == 0 {
            return None;
        }
        let start = Instant::now();
        let route = self.route(size);
        let ptr = match route {
            Route::Large => self.large.alloc(size, self.numa_aware.then_some(node)),
            Route::Slab => self.slab.alloc_on_node(size, node).map(|a| a.ptr),
            Route::Arena => self.arena_for(node).and_then(|arena| arena.allocate(size)),
        };
        let local = !self.numa_aware || node == self.topology.current_node();
        self.record(route, size, ptr, local, start)
    }

    /// Allocate `count * size` zeroed bytes; `None` on overflow
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        // SAFETY: ptr is valid for total bytes
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// With `align` at most a page, large requests go to the tracker and
    /// slab-sized ones to a class whose objects land on `align`; both can
    /// be freed with `size`. Everything else comes from the thread arena and
    /// is only released in bulk.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let node = self.current_node();
        if align <= page_size() {
            if size >= self.large_threshold {
                return self.allocate_routed(size, node, None);
            }
            if let Some(padded) = self.aligned_slab_size(size, align) {
                return self.allocate_routed(padded, node, None);
            }
        }

        let start = Instant::now();
        let padded = if align <= CACHE_LINE_SIZE {
            size
        } else {
            size.checked_add(align - 1)?
        };
        let ptr = self
            .arena_for(node)
            .and_then(|arena| arena.allocate(padded))
            .and_then(|p| align_up(p.as_ptr() as usize, align))
            .and_then(|addr| NonNull::new(addr as *mut u8));
        self.record(Route::Arena, size, ptr, true, start)
    }

    /// Slab request size whose class objects all start on `align`.
    ///
    /// Slabs are page-aligned, so a class whose size is a multiple of
    /// `align` (at most a page) yields aligned objects.
    fn aligned_slab_size(&self, size: usize, align: usize) -> Option<usize> {
        let padded = align_up(size, align)?;
        let classes = self.slab.classes();
        let class = classes.class_for(padded)?;
        (classes.size_of(class) % align == 0).then_some(padded)
    }

    fn allocate_routed(
        &self,
        size: usize,
        node: NodeId,
        arena: Option<&ThreadArena>,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let start = Instant::now();
        let route = self.route(size);
        let (ptr, local) = match route {
            Route::Large => (self.large.alloc(size, self.numa_aware.then_some(node)), true),
            Route::Slab => match self.slab.alloc(size) {
                Some(a) => (Some(a.ptr), a.local),
                None => (None, true),
            },
            Route::Arena => match arena {
                Some(arena) => {
                    let local = !self.numa_aware
                        || arena.preferred_node() == Some(self.topology.current_node());
                    (arena.allocate(size), local)
                }
                None => (self.arena_for(node).and_then(|a| a.allocate(size)), true),
            },
        };
        self.record(route, size, ptr, local, start)
    }

    #[inline]
    fn record(
        &self,
        route: Route,
        size: usize,
        ptr: Option<NonNull<u8>>,
        local: bool,
        start: Instant,
    ) -> Option<NonNull<u8>> {
        let c = &self.counters;
        if ptr.is_none() {
            c.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        c.allocations.fetch_add(1, Ordering::Relaxed);
        c.bytes.fetch_add(size as u64, Ordering::Relaxed);
        let path = match route {
            Route::Slab => &c.slab,
            Route::Arena => &c.arena,
            Route::Large => &c.large,
        };
        path.fetch_add(1, Ordering::Relaxed);
        if local {
            c.numa_local.fetch_add(1, Ordering::Relaxed);
        } else {
            c.numa_remote.fetch_add(1, Ordering::Relaxed);
        }
        c.alloc_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        ptr
    }

    /// Release an individual allocation of `size` bytes.
    ///
    /// Slab objects go back on their free list and large objects are
    /// unmapped. Arena memory is reclaimed by [`Allocator::reset`], so
    /// medium frees succeed without effect. A slab-sized free of an address
    /// no slab owns (an arena pointer, say) is refused with
    /// [`FreeError::NotOwned`] and changes nothing.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Allocator::allocate`] (or a
    /// sibling) on this allocator for the same `size`, and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        if size == 0 {
            return Err(FreeError::UnknownSize(0));
        }
        match self.route(size) {
            Route::Large => self.large.free(ptr).map(drop)?,
            Route::Slab => self.slab.free(ptr, size).map(drop)?,
            Route::Arena => {}
        }
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Per-thread handle that skips the arena registry lookup.
    ///
    /// The handle stays on the calling thread and pins its arena to the node
    /// the thread was running on when it was created.
    pub fn thread_allocator(&self) -> Option<ThreadAllocator<'_>> {
        let arena = self.arena_for(self.current_node())?;
        Some(ThreadAllocator {
            allocator: self,
            arena,
            _not_send: PhantomData,
        })
    }

    /// Rewind every thread arena, keeping their blocks mapped.
    ///
    /// Pointers previously handed out by the arena path must not be used
    /// again. Slab and large objects are untouched.
    pub fn reset(&mut self) {
        for arena in self.arenas.iter() {
            arena.value().rewind();
        }
        tracing::debug!(event = "allocator_reset", arenas = self.arenas.len(), "Thread arenas rewound");
    }

    /// Stranded arena tail bytes over reserved arena bytes
    pub fn fragmentation(&self) -> f64 {
        let arena = self.arena_totals();
        AllocatorStats::ratio(arena.wasted_bytes as u64, arena.reserved_bytes as u64, 0.0)
    }

    /// Every arena block satisfies `start <= cursor <= end`
    pub fn check_integrity(&self) -> bool {
        self.arenas.iter().all(|a| a.value().check_integrity())
    }

    fn arena_totals(&self) -> ThreadArenaStats {
        self.arenas
            .iter()
            .map(|a| a.value().stats())
            .fold(ThreadArenaStats::default(), |mut acc, s| {
                acc.blocks += s.blocks;
                acc.reserved_bytes += s.reserved_bytes;
                acc.used_bytes += s.used_bytes;
                acc.wasted_bytes += s.wasted_bytes;
                acc.allocations += s.allocations;
                acc.bytes_requested += s.bytes_requested;
                acc.grow_contention += s.grow_contention;
                acc
            })
    }

    pub fn stats(&self) -> AllocatorStats {
        let c = &self.counters;
        let allocations = Counters::load(&c.allocations);
        let local = Counters::load(&c.numa_local);
        let remote = Counters::load(&c.numa_remote);
        let arena = self.arena_totals();
        AllocatorStats {
            total_allocations: allocations,
            total_bytes: Counters::load(&c.bytes),
            failed_allocations: Counters::load(&c.failed),
            frees: Counters::load(&c.frees),
            slab_allocations: Counters::load(&c.slab),
            arena_allocations: Counters::load(&c.arena),
            large_allocations: Counters::load(&c.large),
            numa_local: local,
            numa_remote: remote,
            locality_ratio: AllocatorStats::ratio(local, local + remote, 1.0),
            avg_allocation_ns: AllocatorStats::ratio(Counters::load(&c.alloc_nanos), allocations, 0.0),
            thread_arenas: self.arenas.len(),
            fragmentation: AllocatorStats::ratio(
                arena.wasted_bytes as u64,
                arena.reserved_bytes as u64,
                0.0,
            ),
            arena,
            slab: self.slab.stats(),
            large: self.large.stats(),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }

    pub fn large_objects(&self) -> &LargeObjectTracker {
        &self.large
    }

    #[inline]
    pub fn large_object_threshold(&self) -> usize {
        self.large_threshold
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// Calling thread's view of an [`Allocator`]
pub struct ThreadAllocator<'a> {
    allocator: &'a Allocator,
    arena: Arc<ThreadArena>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ThreadAllocator<'a> {
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let node = self.arena.preferred_node().unwrap_or(NodeId::ZERO);
        self.allocator.allocate_routed(size, node, Some(&self.arena))
    }

    /// # Safety
    /// Same contract as [`Allocator::free`].
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), FreeError> {
        self.allocator.free(ptr, size)
    }

    pub fn arena(&self) -> &ThreadArena {
        &self.arena
    }

    pub fn allocator(&self) -> &'a Allocator {
        self.allocator
    }
}
