//! Concurrency, safety and accounting properties of the memory runtime

use ember_runtime::allocator::{BlockPlacement, SizeClasses, SlabAllocator, ThreadArena};
use ember_runtime::numa::Topology;
use ember_runtime::{
    AcquireError, Allocator, FreeError, HandleError, MemoryConfig, PoolConfig, Route, VmSlotPool,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn pool_config(max_slots: usize, per_thread: usize) -> PoolConfig {
    PoolConfig {
        initial_slots: max_slots.min(16),
        chunk_size: 16,
        max_slots,
        max_slots_per_thread: per_thread,
        thread_cache_size: 4,
        rate_limit_window_ms: 60_000,
        rate_limit_quota: 1_000_000,
        scan_retry_budget: 4,
    }
}

fn memory_config() -> MemoryConfig {
    MemoryConfig {
        default_block_size: 1024 * 1024,
        huge_pages: false,
        numa_aware: false,
        ..MemoryConfig::default()
    }
}

fn single_node() -> Arc<Topology> {
    Arc::new(Topology::single_node())
}

// ===== VM slot pool =====

#[test]
fn no_slot_has_two_holders() {
    const SLOTS: usize = 8;
    let pool: VmSlotPool = VmSlotPool::new(pool_config(SLOTS, 2)).unwrap();
    let holders: Vec<AtomicU32> = (0..SLOTS).map(|_| AtomicU32::new(0)).collect();

    thread::scope(|s| {
        for _ in 0..12 {
            s.spawn(|| {
                let worker = pool.thread();
                for round in 0..2_000u64 {
                    let Ok(handle) = worker.acquire() else { continue };
                    let holder = &holders[handle.index() as usize];
                    assert_eq!(holder.fetch_add(1, Ordering::AcqRel), 0, "{} shared", handle);
                    worker
                        .with_instance(handle, |vm| {
                            vm.push(round);
                        })
                        .unwrap();
                    holder.fetch_sub(1, Ordering::AcqRel);
                    worker.release(handle).unwrap();
                }
                worker.flush_cache();
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total_allocations, stats.total_deallocations);
    let security = pool.security_stats();
    assert_eq!(security.double_release_attempts, 0);
    assert_eq!(security.foreign_thread_uses, 0);
}

#[test]
fn stale_handle_is_distinguishable() {
    let pool: VmSlotPool = VmSlotPool::new(pool_config(1, 1)).unwrap();
    let old = pool.acquire().unwrap();
    pool.release(old).unwrap();
    let current = pool.acquire().unwrap();

    assert_eq!(old.index(), current.index());
    assert_eq!(current.generation(), old.generation().wrapping_add(1));
    assert!(!pool.is_live(old));
    assert!(pool.is_live(current));
    assert_eq!(pool.with_instance(old, |_| ()), Err(HandleError::StaleHandle));
    assert_eq!(pool.release(old), Err(HandleError::StaleHandle));
    assert!(pool.is_live(current));
}

#[test]
fn third_acquire_over_cap_counts_one_violation() {
    let pool: VmSlotPool = VmSlotPool::new(pool_config(2, 2)).unwrap();
    assert!(pool.acquire().is_ok());
    assert!(pool.acquire().is_ok());
    let before = pool.security_stats().total_violations;
    assert!(pool.acquire().is_err());
    assert_eq!(pool.security_stats().total_violations, before + 1);
}

#[test]
fn n_plus_one_acquisitions_give_one_rejection() {
    const QUOTA: u32 = 5;
    let config = PoolConfig {
        rate_limit_quota: QUOTA,
        rate_limit_window_ms: 200,
        ..pool_config(16, 16)
    };
    let pool: VmSlotPool = VmSlotPool::new(config).unwrap();

    let mut rejected = 0;
    for _ in 0..=QUOTA {
        match pool.acquire() {
            Ok(handle) => pool.release(handle).unwrap(),
            Err(AcquireError::RateLimited) => rejected += 1,
            Err(other) => panic!("unexpected {}", other),
        }
    }
    assert_eq!(rejected, 1);
    assert_eq!(pool.acquire(), Err(AcquireError::RateLimited));

    thread::sleep(Duration::from_millis(250));
    let handle = pool.acquire().expect("window elapsed");
    pool.release(handle).unwrap();
    assert_eq!(pool.security_stats().rate_limit_denials, 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn release_always_zeroes_instance(
        stack in prop::collection::vec(any::<u64>(), 0..256),
        locals in prop::collection::vec((0usize..64, any::<u64>()), 0..64),
        ip in any::<usize>(),
        message in proptest::option::of("[a-z]{1,24}"),
    ) {
        let pool: VmSlotPool = VmSlotPool::new(pool_config(1, 1)).unwrap();
        let handle = pool.acquire().unwrap();
        pool.with_instance(handle, |vm| {
            for &word in &stack {
                vm.push(word);
            }
            for &(index, value) in &locals {
                vm.set_local(index, value);
            }
            vm.ip = ip;
            vm.error = message.clone();
        }).unwrap();
        pool.release(handle).unwrap();

        let handle = pool.acquire().unwrap();
        let clear = pool.with_instance(handle, |vm| vm.is_clear()).unwrap();
        prop_assert!(clear);
    }

    #[test]
    fn bump_addresses_increase_without_overlap(sizes in prop::collection::vec(1usize..1024, 1..200)) {
        let arena = ThreadArena::new(1024 * 1024, BlockPlacement::default()).unwrap();
        let mut previous_end = 0usize;
        for size in sizes {
            let addr = arena.allocate(size).unwrap().as_ptr() as usize;
            prop_assert!(addr >= previous_end);
            previous_end = addr + size;
        }
        prop_assert_eq!(arena.stats().blocks, 1);
    }

    #[test]
    fn slab_never_hands_out_a_live_address(ops in prop::collection::vec((any::<bool>(), 1usize..4096), 1..400)) {
        let slab = SlabAllocator::new(SizeClasses::standard(), single_node(), false, 64);
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut addresses = HashSet::new();
        for (allocate, size) in ops {
            if allocate || live.is_empty() {
                let object = slab.alloc(size).unwrap();
                let addr = object.ptr.as_ptr() as usize;
                prop_assert!(addresses.insert(addr), "{:#x} handed out twice", addr);
                live.push((addr, size));
            } else {
                let (addr, size) = live.swap_remove(size % live.len());
                addresses.remove(&addr);
                let ptr = std::ptr::NonNull::new(addr as *mut u8).unwrap();
                unsafe { slab.free(ptr, size).unwrap() };
            }
        }
        let stats = slab.stats();
        prop_assert_eq!(stats.total_allocations - stats.total_deallocations, live.len() as u64);
    }
}

// ===== Allocator façade =====

#[test]
fn ten_forty_byte_objects_take_the_slab_path() {
    let allocator = Allocator::with_topology(&memory_config(), single_node()).unwrap();
    assert_eq!(allocator.route(40), Route::Slab);
    let classes = allocator.slab().classes();
    let class = classes.class_for(40).unwrap();
    assert!(classes.size_of(class) >= 48);

    let before = allocator.slab().class_stats(class).unwrap().allocations;
    for _ in 0..10 {
        allocator.allocate(40).unwrap();
    }
    let after = allocator.slab().class_stats(class).unwrap().allocations;
    assert_eq!(after - before, 10);
}

#[test]
fn large_object_free_is_exact_once() {
    let allocator = Allocator::with_topology(&memory_config(), single_node()).unwrap();
    assert_eq!(allocator.route(600_000), Route::Large);
    let ptr = allocator.allocate(600_000).unwrap();
    let records = allocator.large_objects().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].size, 600_000);

    unsafe { allocator.free(ptr, 600_000).unwrap() };
    assert_eq!(allocator.large_objects().live_objects(), 0);
    assert_eq!(allocator.large_objects().stats().mapped_bytes, 0);

    let again = unsafe { allocator.free(ptr, 600_000) };
    assert!(matches!(again, Err(FreeError::UnknownLargeObject(_))));
    let stats = allocator.large_objects().stats();
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.allocations, 1);
}
