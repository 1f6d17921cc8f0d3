//! Allocator statistics snapshots

use super::large::LargeObjectStats;
use super::slab::SlabStats;
use super::thread_arena::ThreadArenaStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters kept by the façade
#[derive(Default)]
pub(crate) struct Counters {
    pub allocations: AtomicU64,
    pub bytes: AtomicU64,
    pub failed: AtomicU64,
    pub frees: AtomicU64,
    pub slab: AtomicU64,
    pub arena: AtomicU64,
    pub large: AtomicU64,
    pub numa_local: AtomicU64,
    pub numa_remote: AtomicU64,
    pub alloc_nanos: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of every allocator counter
#[derive(Debug, Clone, Default, Serialize)]
pub struct AllocatorStats {
    pub total_allocations: u64,
    pub total_bytes: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub slab_allocations: u64,
    pub arena_allocations: u64,
    pub large_allocations: u64,
    pub numa_local: u64,
    pub numa_remote: u64,
    /// Local share of successful allocations, 1.0 with no traffic
    pub locality_ratio: f64,
    pub avg_allocation_ns: f64,
    pub thread_arenas: usize,
    pub arena: ThreadArenaStats,
    /// Stranded arena tail bytes over reserved arena bytes
    pub fragmentation: f64,
    pub slab: SlabStats,
    pub large: LargeObjectStats,
}

impl AllocatorStats {
    pub(crate) fn ratio(part: u64, whole: u64, empty: f64) -> f64 {
        if whole == 0 {
            empty
        } else {
            part as f64 / whole as f64
        }
    }

    /// Human-readable multi-line report
    pub fn report(&self) -> String {
        let mut lines = vec![
            "=== Allocator Statistics ===".to_string(),
            format!(
                "Allocations: {} ({} bytes, {} failed, {} frees)",
                self.total_allocations, self.total_bytes, self.failed_allocations, self.frees
            ),
            format!(
                "Paths: slab {} / arena {} / large {}",
                self.slab_allocations, self.arena_allocations, self.large_allocations
            ),
            format!(
                "NUMA locality: {:.1}% ({} local, {} remote)",
                self.locality_ratio * 100.0,
                self.numa_local,
                self.numa_remote
            ),
            format!("Average latency: {:.1} ns", self.avg_allocation_ns),
            format!(
                "Arenas: {} threads, {} blocks, {} / {} bytes used, fragmentation {:.2}%",
                self.thread_arenas,
                self.arena.blocks,
                self.arena.used_bytes,
                self.arena.reserved_bytes,
                self.fragmentation * 100.0
            ),
            format!(
                "Slabs: {} reserved bytes, {} allocs, {} frees",
                self.slab.reserved_bytes, self.slab.total_allocations, self.slab.total_deallocations
            ),
        ];

        for class in self.slab.classes.iter().filter(|c| c.allocations > 0) {
            lines.push(format!(
                "  {:>6}B: {} allocs, {} frees, {} hits, {} misses",
                class.object_size,
                class.allocations,
                class.deallocations,
                class.cache_hits,
                class.cache_misses
            ));
        }

        lines.push(format!(
            "Large objects: {} live, {} bytes mapped, {} huge-page backed, {} unknown frees",
            self.large.live_objects,
            self.large.mapped_bytes,
            self.large.huge_page_objects,
            self.large.unknown_frees
        ));

        lines.join("\n")
    }
}
