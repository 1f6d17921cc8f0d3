//! Size-classed slab allocator - lock-free free lists per class and node
//!
//! Design: every size class owns one Treiber stack per NUMA node plus a
//! node-agnostic fallback. Heads are tagged pointers so a pop that raced a
//! pop/push pair fails its CAS instead of corrupting the list. Freed objects
//! are recycled, never returned to the OS while the allocator lives.

use super::size_class::{objects_per_slab, SizeClasses};
use crate::error::FreeError;
use crate::numa::{NodeId, Topology};
use crate::os::{page_size, Mapping};
use crate::sync::{retry_bounded, retry_until, Attempt, AtomicTaggedPtr, TaggedPtr};
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Intrusive Treiber stack threaded through the free objects themselves.
///
/// The first word of each free object holds the address of the next one.
struct FreeList {
    head: CachePadded<AtomicTaggedPtr>,
}

impl FreeList {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicTaggedPtr::null()),
        }
    }

    /// Link `first..=last` (already chained) in front of the current head
    ///
    /// # Safety
    /// Every object in the chain must be at least 8 bytes, 8-aligned, and
    /// owned by the caller.
    unsafe fn push_chain(&self, first: usize, last: usize) {
        let link = &*(last as *const AtomicUsize);
        retry_until(|| {
            let head = self.head.load(Ordering::Acquire);
            link.store(head.addr(), Ordering::Relaxed);
            self.head
                .compare_exchange_weak(
                    head,
                    head.successor(first),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .ok()
        });
    }

    fn pop(&self, budget: u32) -> Option<NonNull<u8>> {
        retry_bounded(budget, || {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return Attempt::GiveUp;
            }
            // A racing pop may already have handed this object out and the
            // word may hold user data; the tag makes our CAS fail in that case.
            // SAFETY: objects on a list live in slabs that are never unmapped
            // while the allocator is alive
            let next = unsafe { (*(head.addr() as *const AtomicUsize)).load(Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                head.successor(next),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => match NonNull::new(head.addr() as *mut u8) {
                    Some(ptr) => Attempt::Won(ptr),
                    None => Attempt::GiveUp,
                },
                Err(_) => Attempt::Lost,
            }
        })
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[derive(Default)]
struct ClassCounters {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    slabs_carved: AtomicU64,
}

/// Snapshot of one size class
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SlabClassStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub allocations: u64,
    pub deallocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub slabs_carved: u64,
}

/// Snapshot of the whole slab allocator
#[derive(Debug, Clone, Default, Serialize)]
pub struct SlabStats {
    pub classes: Vec<SlabClassStats>,
    pub reserved_bytes: usize,
    pub total_allocations: u64,
    pub total_deallocations: u64,
}

/// Result of a slab allocation
#[derive(Debug, Clone, Copy)]
pub struct SlabAllocation {
    pub ptr: NonNull<u8>,
    pub class: usize,
    /// Served from the calling thread's node
    pub local: bool,
}

/// One carved slab: objects of `class` packed from the mapping start to `end`
struct SlabSpan {
    class: usize,
    end: usize,
    mapping: Mapping,
}

/// Lock-free size-classed allocator
pub struct SlabAllocator {
    classes: SizeClasses,
    counters: Box<[CachePadded<ClassCounters>]>,
    global: Box<[FreeList]>,
    /// `[node][class]`, empty when NUMA placement is off
    nodes: Box<[Box<[FreeList]>]>,
    topology: Arc<Topology>,
    retry_budget: u32,
    /// Keyed by mapping start
    slabs: RwLock<BTreeMap<usize, SlabSpan>>,
    reserved_bytes: AtomicUsize,
}

impl SlabAllocator {
    pub fn new(classes: SizeClasses, topology: Arc<Topology>, numa_aware: bool, retry_budget: u32) -> Self {
        let per_class = |_| FreeList::new();
        let node_lists = if numa_aware && topology.is_available() {
            topology.node_count()
        } else {
            0
        };

        Self {
            counters: (0..classes.len())
                .map(|_| CachePadded::new(ClassCounters::default()))
                .collect(),
            global: (0..classes.len()).map(per_class).collect(),
            nodes: (0..node_lists)
                .map(|_| (0..classes.len()).map(per_class).collect())
                .collect(),
            classes,
            topology,
            retry_budget,
            slabs: RwLock::new(BTreeMap::new()),
            reserved_bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Largest object this allocator serves
    #[inline]
    pub fn max_object_size(&self) -> usize {
        self.classes.max_size()
    }

    #[inline]
    fn numa_active(&self) -> bool {
        !self.nodes.is_empty()
    }

    fn node_list(&self, node: NodeId, class: usize) -> Option<&FreeList> {
        self.nodes.get(node.index()).map(|lists| &lists[class])
    }

    /// Allocate an object of the smallest class holding `size` bytes.
    ///
    /// Returns `None` when `size` is zero or above the largest class, or
    /// when a fresh slab cannot be mapped.
    pub fn alloc(&self, size: usize) -> Option<SlabAllocation> {
        let node = self.numa_active().then(|| self.topology.current_node());
        self.alloc_from(size, node)
    }

    /// Allocate from `node`'s lists, carving there on a miss. Same as
    /// [`SlabAllocator::alloc`] when NUMA placement is off.
    pub fn alloc_on_node(&self, size: usize, node: NodeId) -> Option<SlabAllocation> {
        let node = (self.numa_active() && self.topology.contains(node)).then_some(node);
        self.alloc_from(size, node)
    }

    fn alloc_from(&self, size: usize, node: Option<NodeId>) -> Option<SlabAllocation> {
        let class = self.classes.class_for(size)?;
        let counters = &self.counters[class];

        let local_hit = node
            .and_then(|n| self.node_list(n, class))
            .and_then(|list| list.pop(self.retry_budget));
        let hit = match local_hit {
            Some(ptr) => Some((ptr, true)),
            None => self.global[class]
                .pop(self.retry_budget)
                .map(|ptr| (ptr, !self.numa_active())),
        };

        let (ptr, local) = match hit {
            Some(found) => {
                counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                found
            }
            None => {
                counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                (self.carve(class, node)?, true)
            }
        };

        counters.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(event = "slab_alloc", class = class, address = ?ptr.as_ptr());
        Some(SlabAllocation { ptr, class, local })
    }

    /// Return an object to the list of the class its slab was carved for,
    /// on the calling thread's node.
    ///
    /// Addresses that are not the start of an object in one of this
    /// allocator's slabs, or whose object is smaller than `size`, are
    /// refused without touching any list.
    ///
    /// # Safety
    /// `ptr` must come from this allocator, be currently allocated, and not
    /// be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<usize, FreeError> {
        let requested = self
            .classes
            .class_for(size)
            .ok_or(FreeError::UnknownSize(size))?;
        let addr = ptr.as_ptr() as usize;
        let class = self.object_class(addr).ok_or(FreeError::NotOwned(addr))?;
        if class < requested {
            return Err(FreeError::SizeMismatch { address: addr, size });
        }

        let list = if self.numa_active() {
            self.node_list(self.topology.current_node(), class)
                .unwrap_or(&self.global[class])
        } else {
            &self.global[class]
        };
        list.push_chain(addr, addr);

        self.counters[class]
            .deallocations
            .fetch_add(1, Ordering::Relaxed);
        trace!(event = "slab_free", class = class, address = ?ptr.as_ptr());
        Ok(class)
    }

    /// Map a new slab for `class`, keep the first object, list the rest
    #[cold]
    fn carve(&self, class: usize, node: Option<NodeId>) -> Option<NonNull<u8>> {
        let object_size = self.classes.size_of(class);
        let count = objects_per_slab(object_size, page_size());
        let len = object_size.checked_mul(count)?;

        let mapping = Mapping::anonymous(len, false)?;
        if !TaggedPtr::fits(mapping.end()) {
            warn!(
                event = "slab_address_out_of_range",
                address = mapping.start(),
                "Slab mapped above taggable address range"
            );
            return None;
        }
        if let Some(node) = node {
            mapping.bind_to_node(node);
        }

        let base = mapping.start();
        let first = NonNull::new(base as *mut u8)?;
        if count > 1 {
            let second = base + object_size;
            let last = base + (count - 1) * object_size;
            let mut addr = second;
            while addr < last {
                // SAFETY: addr and addr + object_size lie inside the fresh mapping
                unsafe { (*(addr as *const AtomicUsize)).store(addr + object_size, Ordering::Relaxed) };
                addr += object_size;
            }
            let list = node
                .and_then(|n| self.node_list(n, class))
                .unwrap_or(&self.global[class]);
            // SAFETY: the chain is private until the push publishes it
            unsafe { list.push_chain(second, last) };
        }

        self.reserved_bytes
            .fetch_add(mapping.len(), Ordering::Relaxed);
        self.counters[class]
            .slabs_carved
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            event = "slab_carved",
            object_size = object_size,
            objects = count,
            node = ?node,
            "New slab carved"
        );
        self.slabs.write().insert(
            base,
            SlabSpan {
                class,
                end: base + len,
                mapping,
            },
        );
        Some(first)
    }

    /// Whether any list of `class` currently holds a free object
    pub fn has_free(&self, class: usize) -> bool {
        !self.global[class].is_empty()
            || self.nodes.iter().any(|lists| !lists[class].is_empty())
    }

    /// Whether `addr` lies in a slab of this allocator
    pub fn contains(&self, addr: usize) -> bool {
        self.slabs
            .read()
            .range(..=addr)
            .next_back()
            .map_or(false, |(_, span)| span.mapping.contains(addr))
    }

    /// Class of the object starting exactly at `addr`
    fn object_class(&self, addr: usize) -> Option<usize> {
        let slabs = self.slabs.read();
        let (&start, span) = slabs.range(..=addr).next_back()?;
        let object_size = self.classes.size_of(span.class);
        (addr < span.end && (addr - start) % object_size == 0).then_some(span.class)
    }

    pub fn class_stats(&self, class: usize) -> Option<SlabClassStats> {
        let counters = self.counters.get(class)?;
        let object_size = self.classes.size_of(class);
        Some(SlabClassStats {
            object_size,
            objects_per_slab: objects_per_slab(object_size, page_size()),
            allocations: counters.allocations.load(Ordering::Relaxed),
            deallocations: counters.deallocations.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            slabs_carved: counters.slabs_carved.load(Ordering::Relaxed),
        })
    }

    pub fn stats(&self) -> SlabStats {
        let classes: Vec<_> = (0..self.classes.len())
            .filter_map(|c| self.class_stats(c))
            .collect();
        SlabStats {
            total_allocations: classes.iter().map(|c| c.allocations).sum(),
            total_deallocations: classes.iter().map(|c| c.deallocations).sum(),
            reserved_bytes: self.reserved_bytes.load(Ordering::Relaxed),
            classes,
        }
    }
}
