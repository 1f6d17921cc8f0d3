//! Memory context tests
//!
//! - Family: allocator selection per object kind and block scaling
//! - Accounting: live, peak and per-collection byte counters
//! - Pressure: edge-triggered threshold crossings

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::numa::Topology;
    use std::sync::atomic::AtomicUsize;

    fn test_config(threshold: usize) -> MemoryConfig {
        MemoryConfig {
            default_block_size: 64 * 1024,
            huge_pages: false,
            numa_aware: false,
            pressure_threshold: threshold,
            ..MemoryConfig::default()
        }
    }

    fn context(threshold: usize) -> MemoryContext {
        MemoryContext::with_topology(&test_config(threshold), Arc::new(Topology::single_node()))
            .expect("context")
    }

    // ===== Family Tests =====

    #[test]
    fn block_sizes_scale_per_family() {
        let ctx = context(1 << 30);
        assert_eq!(ctx.family(AllocatorFamily::Vm).block_size(), 64 * 1024);
        assert_eq!(ctx.family(AllocatorFamily::Objects).block_size(), 32 * 1024);
        assert_eq!(ctx.family(AllocatorFamily::Strings).block_size(), 16 * 1024);
        assert_eq!(scaled_block(100, 4), 64);
    }

    #[test]
    fn kind_selects_allocator() {
        let ctx = context(1 << 30);
        ctx.allocate_object(100, ObjectKind::String).unwrap();
        ctx.allocate_object(100, ObjectKind::Array).unwrap();
        ctx.allocate_object(100, ObjectKind::HashMap).unwrap();
        ctx.allocate_object(100, ObjectKind::VmInternal).unwrap();
        ctx.allocate_object(100, ObjectKind::Function).unwrap();

        let stats = ctx.statistics();
        assert_eq!(stats.strings.total_allocations, 1);
        assert_eq!(stats.objects.total_allocations, 2);
        assert_eq!(stats.vm.total_allocations, 2);
        assert_eq!(stats.kinds.array, 1);
        assert_eq!(stats.kinds.function, 1);
        assert_eq!(stats.total_allocations, 5);
    }

    #[test]
    fn string_reserves_terminator() {
        let ctx = context(1 << 30);
        let ptr = ctx.allocate_string(40).unwrap();
        assert_eq!(ctx.statistics().current_bytes, 41);
        unsafe { ctx.free_string(ptr, 40).unwrap() };
        assert_eq!(ctx.statistics().current_bytes, 0);
    }

    #[test]
    fn large_objects_counted_across_kinds() {
        let ctx = context(1 << 30);
        let ptr = ctx.allocate_object(600_000, ObjectKind::Array).unwrap();
        let stats = ctx.statistics();
        assert_eq!(stats.kinds.large, 1);
        assert_eq!(stats.kinds.array, 1);
        assert_eq!(stats.objects.large.live_objects, 1);
        unsafe { ctx.free_object(ptr, 600_000, ObjectKind::Array).unwrap() };
        assert_eq!(ctx.statistics().objects.large.live_objects, 0);
    }

    // ===== Accounting Tests =====

    #[test]
    fn peak_and_efficiency() {
        let ctx = context(1 << 30);
        let a = ctx.allocate_object(1000, ObjectKind::Object).unwrap();
        ctx.allocate_object(1000, ObjectKind::Object).unwrap();
        ctx.allocate_object(1000, ObjectKind::Object).unwrap();
        unsafe { ctx.free_object(a, 1000, ObjectKind::Object).unwrap() };

        let stats = ctx.statistics();
        assert_eq!(stats.current_bytes, 2000);
        assert_eq!(stats.peak_bytes, 3000);
        assert_eq!(stats.total_bytes, 3000);
        assert!((stats.efficiency - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.locality_ratio, 1.0);
    }

    #[test]
    fn zero_size_counts_as_failure() {
        let ctx = context(1 << 30);
        assert!(ctx.allocate_object(0, ObjectKind::Object).is_none());
        assert_eq!(ctx.statistics().failed_allocations, 1);
        assert_eq!(ctx.statistics().total_allocations, 0);
    }

    #[test]
    fn reset_drops_arena_usage() {
        let mut ctx = context(1 << 30);
        ctx.allocate_object(100_000, ObjectKind::VmInternal).unwrap();
        ctx.allocate_object(64, ObjectKind::Object).unwrap();
        assert_eq!(ctx.statistics().current_bytes, 100_064);

        ctx.reset();
        assert_eq!(ctx.statistics().current_bytes, 64);
        assert!(ctx.check_integrity());
    }

    #[test]
    fn collection_resets_byte_counter() {
        let ctx = context(1 << 30);
        ctx.allocate_object(500, ObjectKind::Instance).unwrap();
        ctx.allocate_object(300, ObjectKind::Instance).unwrap();
        assert_eq!(ctx.record_collection(), 800);
        assert_eq!(ctx.statistics().bytes_since_collection, 0);
    }

    #[test]
    fn report_mentions_pressure_state() {
        let ctx = context(1 << 30);
        ctx.allocate_object(10, ObjectKind::Object).unwrap();
        let report = ctx.statistics().report();
        assert!(report.contains("Pressure: normal"));
        assert!(report.contains("object 1"));
    }

    // ===== Pressure Tests =====

    #[test]
    fn pressure_is_edge_triggered() {
        let ctx = context(10_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        ctx.set_pressure_callback(move |event| {
            assert!(event.current_bytes > event.threshold_bytes);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let a = ctx.allocate_object(6000, ObjectKind::Object).unwrap();
        assert!(!ctx.check_pressure());
        let b = ctx.allocate_object(6000, ObjectKind::Object).unwrap();
        assert!(ctx.check_pressure());
        assert!(ctx.check_pressure());
        ctx.allocate_object(100, ObjectKind::Object).unwrap();
        assert!(ctx.check_pressure());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        unsafe {
            ctx.free_object(a, 6000, ObjectKind::Object).unwrap();
            ctx.free_object(b, 6000, ObjectKind::Object).unwrap();
        }
        assert!(!ctx.check_pressure());
        assert!(!ctx.is_under_pressure());

        ctx.allocate_object(6000, ObjectKind::Object).unwrap();
        ctx.allocate_object(6000, ObjectKind::Object).unwrap();
        assert!(ctx.check_pressure());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.statistics().pressure_crossings, 2);
    }
}
