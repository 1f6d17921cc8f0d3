//! Allocator façade tests
//!
//! Test suite organized by component:
//! - Routing: size thresholds and the path each request takes
//! - Slab Path: class selection and reuse through the façade
//! - Large Path: tracked mappings and unknown frees
//! - Variants: zeroed, aligned and node-targeted allocation
//! - Ownership: frees only reach the allocator that owns the address
//! - Arenas: thread handles, reset, fragmentation
//! - Concurrency: distinct addresses under many threads

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::numa::Topology;
    use std::collections::HashSet;

    fn test_config() -> MemoryConfig {
        MemoryConfig {
            default_block_size: 256 * 1024,
            huge_pages: false,
            numa_aware: false,
            ..MemoryConfig::default()
        }
    }

    fn allocator() -> Allocator {
        Allocator::with_topology(&test_config(), Arc::new(Topology::single_node()))
            .expect("allocator")
    }

    // ===== Routing Tests =====

    #[test]
    fn route_boundaries() {
        let allocator = allocator();
        assert_eq!(allocator.route(1), Route::Slab);
        assert_eq!(allocator.route(65_536), Route::Slab);
        assert_eq!(allocator.route(65_537), Route::Arena);
        assert_eq!(allocator.route(524_287), Route::Arena);
        assert_eq!(allocator.route(524_288), Route::Large);
    }

    #[test]
    fn zero_size_is_refused() {
        let allocator = allocator();
        assert!(allocator.allocate(0).is_none());
        assert!(allocator.allocate_aligned(0, 64).is_none());
        assert_eq!(allocator.stats().total_allocations, 0);
    }

    #[test]
    fn threshold_must_exceed_largest_class() {
        let config = MemoryConfig {
            large_object_threshold: 65_536,
            ..test_config()
        };
        assert!(Allocator::with_topology(&config, Arc::new(Topology::single_node())).is_err());
    }

    // ===== Slab Path Tests =====

    #[test]
    fn forty_byte_objects_use_the_64_byte_class() {
        let allocator = allocator();
        let class = allocator.slab().classes().class_for(40).unwrap();
        assert_eq!(allocator.slab().classes().size_of(class), 64);
        let before = allocator.slab().class_stats(class).unwrap().allocations;

        let ptrs: Vec<_> = (0..10).map(|_| allocator.allocate(40).unwrap()).collect();

        let after = allocator.slab().class_stats(class).unwrap().allocations;
        assert_eq!(after - before, 10);
        let distinct: HashSet<_> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), 10);
        assert_eq!(allocator.stats().slab_allocations, 10);
    }

    #[test]
    fn freed_slab_object_is_reused() {
        let allocator = allocator();
        let ptr = allocator.allocate(100).unwrap();
        unsafe { allocator.free(ptr, 100).unwrap() };
        let again = allocator.allocate(100).unwrap();
        assert_eq!(ptr, again);
        assert_eq!(allocator.stats().frees, 1);
    }

    #[test]
    fn free_with_zero_size_is_rejected() {
        let allocator = allocator();
        let ptr = allocator.allocate(16).unwrap();
        assert_eq!(unsafe { allocator.free(ptr, 0) }, Err(FreeError::UnknownSize(0)));
    }

    // ===== Large Path Tests =====

    #[test]
    fn large_object_round_trip() {
        let allocator = allocator();
        let ptr = allocator.allocate(600_000).unwrap();
        assert_eq!(allocator.large_objects().live_objects(), 1);
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 600_000) };

        unsafe { allocator.free(ptr, 600_000).unwrap() };
        assert_eq!(allocator.large_objects().live_objects(), 0);

        let second = unsafe { allocator.free(ptr, 600_000) };
        assert_eq!(second, Err(FreeError::UnknownLargeObject(ptr.as_ptr() as usize)));
        let stats = allocator.stats();
        assert_eq!(stats.large.frees, 1);
        assert_eq!(stats.large.unknown_frees, 1);
        assert_eq!(stats.frees, 1);
    }

    // ===== Variant Tests =====

    #[test]
    fn zeroed_allocation() {
        let allocator = allocator();
        let ptr = allocator.allocate(256).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xFF, 256);
            allocator.free(ptr, 256).unwrap();
        }
        let zeroed = allocator.allocate_zeroed(32, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert!(allocator.allocate_zeroed(usize::MAX, 2).is_none());
    }

    #[test]
    fn aligned_allocation() {
        let allocator = allocator();
        for align in [8, 64, 128, 4096] {
            let ptr = allocator.allocate_aligned(100, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "not aligned to {}", align);
        }
        assert!(allocator.allocate_aligned(100, 48).is_none());

        let large = allocator.allocate_aligned(600_000, 4096).unwrap();
        assert_eq!(large.as_ptr() as usize % 4096, 0);
        assert_eq!(allocator.large_objects().live_objects(), 1);
    }

    #[test]
    fn node_targeted_allocation() {
        let allocator = allocator();
        let ptr = allocator.allocate_on_node(100_000, NodeId::ZERO).unwrap();
        let arena = allocator.thread_allocator().unwrap();
        assert!(arena.arena().contains(ptr.as_ptr() as usize));

        // Unknown nodes fall back to ordinary routing
        assert!(allocator.allocate_on_node(40, NodeId::new(7)).is_some());
        assert_eq!(allocator.stats().numa_remote, 0);
    }

    #[test]
    fn node_targeted_small_objects_come_from_the_slab() {
        let allocator = allocator();
        let ptr = allocator.allocate_on_node(40, NodeId::ZERO).unwrap();
        assert!(allocator.slab().contains(ptr.as_ptr() as usize));
        assert_eq!(allocator.stats().slab_allocations, 1);

        unsafe { allocator.free(ptr, 40).unwrap() };
        assert_eq!(allocator.allocate(40).unwrap(), ptr);
    }

    #[test]
    fn aligned_small_objects_come_from_the_slab() {
        let allocator = allocator();
        let ptr = allocator.allocate_aligned(40, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert!(allocator.slab().contains(ptr.as_ptr() as usize));

        unsafe { allocator.free(ptr, 40).unwrap() };
        assert_eq!(allocator.allocate_aligned(40, 16).unwrap(), ptr);
    }

    // ===== Ownership Tests =====

    #[test]
    fn arena_pointer_never_reaches_a_slab_list() {
        let mut allocator = allocator();
        let handle = allocator.thread_allocator().unwrap();
        let arena_ptr = handle.arena().allocate(40).unwrap();
        let addr = arena_ptr.as_ptr() as usize;
        drop(handle);

        assert_eq!(unsafe { allocator.free(arena_ptr, 40) }, Err(FreeError::NotOwned(addr)));
        assert_eq!(allocator.stats().frees, 0);
        assert_ne!(allocator.allocate(40).unwrap(), arena_ptr);

        // The arena hands the address out again; the slab must not
        allocator.reset();
        let again = allocator.thread_allocator().unwrap().arena().allocate(40).unwrap();
        assert_eq!(again, arena_ptr);
        assert_ne!(allocator.allocate(40).unwrap(), again);
    }

    #[test]
    fn over_page_aligned_arena_pointer_is_refused() {
        let allocator = allocator();
        let align = crate::os::page_size() * 2;
        let ptr = allocator.allocate_aligned(40, align).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        assert!(!allocator.slab().contains(ptr.as_ptr() as usize));

        let result = unsafe { allocator.free(ptr, 40) };
        assert_eq!(result, Err(FreeError::NotOwned(ptr.as_ptr() as usize)));
        assert_ne!(allocator.allocate(40).unwrap(), ptr);
    }

    #[test]
    fn slab_free_checks_object_bounds() {
        let allocator = allocator();
        let ptr = allocator.allocate(40).unwrap();
        let addr = ptr.as_ptr() as usize;

        let interior = NonNull::new((addr + 8) as *mut u8).unwrap();
        assert_eq!(unsafe { allocator.free(interior, 40) }, Err(FreeError::NotOwned(addr + 8)));
        assert_eq!(
            unsafe { allocator.free(ptr, 1000) },
            Err(FreeError::SizeMismatch { address: addr, size: 1000 })
        );
        assert_eq!(allocator.slab().stats().total_deallocations, 0);

        unsafe { allocator.free(ptr, 40).unwrap() };
        assert_eq!(allocator.stats().frees, 1);
    }

    // ===== Arena Tests =====

    #[test]
    fn thread_allocator_uses_one_arena() {
        let allocator = allocator();
        let handle = allocator.thread_allocator().unwrap();
        let a = handle.allocate(100_000).unwrap();
        let b = handle.allocate(100_000).unwrap();
        assert!(handle.arena().contains(a.as_ptr() as usize));
        assert!(handle.arena().contains(b.as_ptr() as usize));
        assert_eq!(allocator.stats().thread_arenas, 1);
        assert_eq!(allocator.stats().arena_allocations, 2);
    }

    #[test]
    fn reset_rewinds_arenas() {
        let mut allocator = allocator();
        allocator.allocate(100_000).unwrap();
        allocator.allocate(100_000).unwrap();
        assert!(allocator.stats().arena.used_bytes >= 200_000);

        allocator.reset();
        assert_eq!(allocator.stats().arena.used_bytes, 0);
        assert!(allocator.check_integrity());
        assert!(allocator.allocate(100_000).is_some());
    }

    #[test]
    fn fragmentation_is_measured() {
        let allocator = allocator();
        assert_eq!(allocator.fragmentation(), 0.0);

        allocator.allocate(200_000).unwrap();
        assert_eq!(allocator.fragmentation(), 0.0);

        // Does not fit the first block's tail, which becomes waste
        allocator.allocate(100_032).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.arena.blocks, 2);
        let block = stats.arena.reserved_bytes / 2;
        assert_eq!(stats.arena.wasted_bytes, block - 200_000);
        let expected = (block - 200_000) as f64 / stats.arena.reserved_bytes as f64;
        assert!((allocator.fragmentation() - expected).abs() < 1e-9);
        assert!(allocator.check_integrity());
    }

    #[test]
    fn stats_report_lists_paths() {
        let allocator = allocator();
        allocator.allocate(40).unwrap();
        allocator.allocate(100_000).unwrap();
        allocator.allocate(600_000).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.slab_allocations, 1);
        assert_eq!(stats.arena_allocations, 1);
        assert_eq!(stats.large_allocations, 1);
        assert_eq!(stats.locality_ratio, 1.0);

        let report = stats.report();
        assert!(report.contains("slab 1 / arena 1 / large 1"));
        assert!(report.contains("64B: 1 allocs"));
    }

    // ===== Concurrency Tests =====

    #[test]
    fn concurrent_allocations_are_distinct() {
        let allocator = allocator();
        let per_thread: Vec<Vec<usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let allocator = &allocator;
                    s.spawn(move || {
                        let size = if i % 2 == 0 { 24 } else { 70_000 };
                        (0..200)
                            .map(|_| allocator.allocate(size).unwrap().as_ptr() as usize)
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: HashSet<usize> = per_thread.iter().flatten().copied().collect();
        assert_eq!(all.len(), 8 * 200);
        assert_eq!(allocator.stats().thread_arenas, 4);
        assert!(allocator.check_integrity());
    }
}
