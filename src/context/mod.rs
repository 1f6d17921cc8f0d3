//! Runtime memory context - the allocation surface the interpreter calls
//!
//! Holds three allocators (general objects, strings, VM-internal) built
//! from one [`MemoryConfig`], tracks live and peak usage across them, and
//! raises an edge-triggered pressure signal when usage crosses the
//! configured threshold.

mod pressure;

#[cfg(test)]
mod tests;

pub use pressure::{PressureCallback, PressureEvent};

use crate::allocator::{Allocator, AllocatorStats, Route};
use crate::config::MemoryConfig;
use crate::error::{ConfigError, FreeError};
use crate::numa::{self, Topology};
use crate::os::CACHE_LINE_SIZE;
use pressure::PressureMonitor;
use serde::Serialize;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What an allocation is for. Only picks the allocator; routing by size is
/// the same for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Object,
    String,
    Array,
    HashMap,
    Instance,
    Function,
    VmInternal,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Object,
        ObjectKind::String,
        ObjectKind::Array,
        ObjectKind::HashMap,
        ObjectKind::Instance,
        ObjectKind::Function,
        ObjectKind::VmInternal,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Object => "object",
            ObjectKind::String => "string",
            ObjectKind::Array => "array",
            ObjectKind::HashMap => "hash_map",
            ObjectKind::Instance => "instance",
            ObjectKind::Function => "function",
            ObjectKind::VmInternal => "vm_internal",
        }
    }

    /// Allocator that serves this kind
    pub const fn family(self) -> AllocatorFamily {
        match self {
            ObjectKind::String => AllocatorFamily::Strings,
            ObjectKind::Function | ObjectKind::VmInternal => AllocatorFamily::Vm,
            _ => AllocatorFamily::Objects,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three allocators a context owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorFamily {
    Objects,
    Strings,
    Vm,
}

/// Allocation count per [`ObjectKind`], plus large objects across kinds
#[derive(Debug, Clone, Default, Serialize)]
pub struct KindBreakdown {
    pub object: u64,
    pub string: u64,
    pub array: u64,
    pub hash_map: u64,
    pub instance: u64,
    pub function: u64,
    pub vm_internal: u64,
    pub large: u64,
}

/// Snapshot of context-level usage
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub total_bytes: u64,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
    /// Live bytes over bytes ever allocated
    pub efficiency: f64,
    /// Local share of allocations across the three allocators
    pub locality_ratio: f64,
    pub avg_allocation_ns: f64,
    pub bytes_since_collection: u64,
    pub pressure_threshold: usize,
    pub under_pressure: bool,
    pub pressure_crossings: u64,
    pub kinds: KindBreakdown,
    pub objects: AllocatorStats,
    pub strings: AllocatorStats,
    pub vm: AllocatorStats,
}

impl MemoryStats {
    /// Human-readable summary
    pub fn report(&self) -> String {
        let k = &self.kinds;
        let lines = [
            "=== Memory Context ===".to_string(),
            format!(
                "Usage: {} bytes live, {} peak, {} total ({:.1}% efficiency)",
                self.current_bytes,
                self.peak_bytes,
                self.total_bytes,
                self.efficiency * 100.0
            ),
            format!(
                "Allocations: {} ok, {} failed, {} frees, {:.1} ns avg",
                self.total_allocations, self.failed_allocations, self.total_frees, self.avg_allocation_ns
            ),
            format!(
                "Kinds: object {} / string {} / array {} / hash_map {} / instance {} / function {} / vm {} / large {}",
                k.object, k.string, k.array, k.hash_map, k.instance, k.function, k.vm_internal, k.large
            ),
            format!("NUMA locality: {:.1}%", self.locality_ratio * 100.0),
            format!(
                "Pressure: {} (threshold {} bytes, {} crossings)",
                if self.under_pressure { "HIGH" } else { "normal" },
                self.pressure_threshold,
                self.pressure_crossings
            ),
        ];
        lines.join("\n")
    }
}

#[derive(Default)]
struct Usage {
    current: AtomicUsize,
    peak: AtomicUsize,
    total_bytes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    failed: AtomicU64,
    since_collection: AtomicU64,
    kinds: [AtomicU64; 7],
    large: AtomicU64,
}

/// Memory context shared by every interpreter thread
pub struct MemoryContext {
    config: MemoryConfig,
    objects: Allocator,
    strings: Allocator,
    vm: Allocator,
    usage: Usage,
    pressure: PressureMonitor,
}

/// Round down to a cache-line multiple, never below one line
fn scaled_block(base: usize, divisor: usize) -> usize {
    ((base / divisor) / CACHE_LINE_SIZE).max(1) * CACHE_LINE_SIZE
}

impl MemoryContext {
    /// Build against the process topology
    pub fn new(config: &MemoryConfig) -> Result<Self, ConfigError> {
        Self::with_topology(config, numa::detect())
    }

    /// Build against an explicit topology.
    ///
    /// VM-internal blocks use the configured size; object blocks half of
    /// it and string blocks a quarter.
    pub fn with_topology(config: &MemoryConfig, topology: Arc<Topology>) -> Result<Self, ConfigError> {
        config.validate()?;
        let sized = |divisor: usize| MemoryConfig {
            default_block_size: scaled_block(config.default_block_size, divisor),
            ..config.clone()
        };

        let context = Self {
            objects: Allocator::with_topology(&sized(2), Arc::clone(&topology))?,
            strings: Allocator::with_topology(&sized(4), Arc::clone(&topology))?,
            vm: Allocator::with_topology(config, topology)?,
            usage: Usage::default(),
            pressure: PressureMonitor::new(config.pressure_threshold),
            config: config.clone(),
        };
        debug!(
            event = "memory_context_created",
            vm_block = context.vm.block_size(),
            object_block = context.objects.block_size(),
            string_block = context.strings.block_size(),
            pressure_threshold = config.pressure_threshold,
            "Memory context ready"
        );
        Ok(context)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Allocator serving `kind`
    pub fn allocator(&self, kind: ObjectKind) -> &Allocator {
        self.family(kind.family())
    }

    pub fn family(&self, family: AllocatorFamily) -> &Allocator {
        match family {
            AllocatorFamily::Objects => &self.objects,
            AllocatorFamily::Strings => &self.strings,
            AllocatorFamily::Vm => &self.vm,
        }
    }

    /// Allocate `size` bytes for an object of `kind`
    pub fn allocate_object(&self, size: usize, kind: ObjectKind) -> Option<NonNull<u8>> {
        let allocator = self.allocator(kind);
        let ptr = allocator.allocate(size);
        let u = &self.usage;
        match ptr {
            Some(_) => {
                let current = u.current.fetch_add(size, Ordering::AcqRel) + size;
                u.peak.fetch_max(current, Ordering::AcqRel);
                u.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
                u.allocations.fetch_add(1, Ordering::Relaxed);
                u.since_collection.fetch_add(size as u64, Ordering::Relaxed);
                u.kinds[kind.index()].fetch_add(1, Ordering::Relaxed);
                if allocator.route(size) == Route::Large {
                    u.large.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                u.failed.fetch_add(1, Ordering::Relaxed);
                if size > 0 {
                    crate::logging::log_allocation_failure(size, kind.as_str());
                }
            }
        }
        ptr
    }

    /// Allocate room for a `len`-byte string plus its terminator
    pub fn allocate_string(&self, len: usize) -> Option<NonNull<u8>> {
        self.allocate_object(len.checked_add(1)?, ObjectKind::String)
    }

    /// Release an object allocated with [`MemoryContext::allocate_object`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate_object` on this context with the same
    /// `size` and `kind`, and must not be used afterwards.
    pub unsafe fn free_object(&self, ptr: NonNull<u8>, size: usize, kind: ObjectKind) -> Result<(), FreeError> {
        self.allocator(kind).free(ptr, size)?;
        let u = &self.usage;
        // Saturate: bytes reclaimed by reset are already off the books
        let _ = u
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(size)));
        u.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Free a string from [`MemoryContext::allocate_string`]
    ///
    /// # Safety
    /// Same contract as [`MemoryContext::free_object`], with the `len` passed to `allocate_string`.
    pub unsafe fn free_string(&self, ptr: NonNull<u8>, len: usize) -> Result<(), FreeError> {
        self.free_object(ptr, len.saturating_add(1), ObjectKind::String)
    }

    // ===== Pressure =====

    /// Compare live usage with the threshold.
    ///
    /// Returns whether the context is under pressure. The callback fires
    /// once when usage first exceeds the threshold and re-arms only after
    /// usage falls back to or below it.
    pub fn check_pressure(&self) -> bool {
        let current = self.usage.current.load(Ordering::Acquire);
        let peak = self.usage.peak.load(Ordering::Relaxed);
        self.pressure.observe(current, peak)
    }

    /// Install the pressure-onset callback, replacing any previous one
    pub fn set_pressure_callback<F>(&self, callback: F)
    where
        F: Fn(&PressureEvent) + Send + Sync + 'static,
    {
        self.pressure.set_callback(Some(Arc::new(callback)));
    }

    pub fn clear_pressure_callback(&self) {
        self.pressure.set_callback(None);
    }

    /// Pressure flag as of the last [`MemoryContext::check_pressure`]
    pub fn is_under_pressure(&self) -> bool {
        self.pressure.is_under()
    }

    /// Reset the bytes-since-collection counter once a collector has run
    pub fn record_collection(&self) -> u64 {
        self.usage.since_collection.swap(0, Ordering::AcqRel)
    }

    // ===== Maintenance =====

    /// Rewind every arena. Arena-path pointers handed out so far must not
    /// be used again; live usage is recomputed from slab and large objects
    /// still outstanding.
    pub fn reset(&mut self) {
        self.objects.reset();
        self.strings.reset();
        self.vm.reset();
        let live: usize = [&self.objects, &self.strings, &self.vm]
            .iter()
            .map(|a| {
                let s = a.stats();
                s.large.mapped_bytes + live_slab_bytes(&s)
            })
            .sum();
        self.usage.current.store(live, Ordering::Release);
        self.check_pressure();
    }

    /// All three allocators pass their integrity checks and the usage
    /// counters agree with each other
    pub fn check_integrity(&self) -> bool {
        let u = &self.usage;
        let kinds: u64 = u.kinds.iter().map(|k| k.load(Ordering::Relaxed)).sum();
        self.objects.check_integrity()
            && self.strings.check_integrity()
            && self.vm.check_integrity()
            && kinds == u.allocations.load(Ordering::Relaxed)
            && u.current.load(Ordering::Relaxed) <= u.peak.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> MemoryStats {
        let u = &self.usage;
        let objects = self.objects.stats();
        let strings = self.strings.stats();
        let vm = self.vm.stats();

        let current = u.current.load(Ordering::Acquire);
        let total_bytes = u.total_bytes.load(Ordering::Relaxed);
        let sum = |f: fn(&AllocatorStats) -> u64| f(&objects) + f(&strings) + f(&vm);
        let local = sum(|s: &AllocatorStats| s.numa_local);
        let remote = sum(|s: &AllocatorStats| s.numa_remote);
        let allocations = sum(|s: &AllocatorStats| s.total_allocations);
        let nanos = [&objects, &strings, &vm]
            .iter()
            .map(|s| s.avg_allocation_ns * s.total_allocations as f64)
            .sum::<f64>();
        let kind = |k: ObjectKind| u.kinds[k.index()].load(Ordering::Relaxed);

        MemoryStats {
            current_bytes: current,
            peak_bytes: u.peak.load(Ordering::Relaxed),
            total_bytes,
            total_allocations: u.allocations.load(Ordering::Relaxed),
            total_frees: u.frees.load(Ordering::Relaxed),
            failed_allocations: u.failed.load(Ordering::Relaxed),
            efficiency: AllocatorStats::ratio(current as u64, total_bytes, 0.0),
            locality_ratio: AllocatorStats::ratio(local, local + remote, 1.0),
            avg_allocation_ns: if allocations == 0 { 0.0 } else { nanos / allocations as f64 },
            bytes_since_collection: u.since_collection.load(Ordering::Relaxed),
            pressure_threshold: self.pressure.threshold(),
            under_pressure: self.pressure.is_under(),
            pressure_crossings: self.pressure.crossings(),
            kinds: KindBreakdown {
                object: kind(ObjectKind::Object),
                string: kind(ObjectKind::String),
                array: kind(ObjectKind::Array),
                hash_map: kind(ObjectKind::HashMap),
                instance: kind(ObjectKind::Instance),
                function: kind(ObjectKind::Function),
                vm_internal: kind(ObjectKind::VmInternal),
                large: u.large.load(Ordering::Relaxed),
            },
            objects,
            strings,
            vm,
        }
    }
}

/// Bytes held by slab objects not yet freed
fn live_slab_bytes(stats: &AllocatorStats) -> usize {
    stats
        .slab
        .classes
        .iter()
        .map(|c| c.allocations.saturating_sub(c.deallocations) as usize * c.object_size)
        .sum()
}
