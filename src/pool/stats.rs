//! Pool statistics and security audit

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kinds of misuse the pool counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Violation {
    NotInitialized,
    ThreadLimit,
    RateLimited,
    CapacityExhausted,
    DoubleRelease,
    StaleHandle,
    InvalidHandle,
    ForeignThread,
}

impl Violation {
    pub fn as_str(self) -> &'static str {
        match self {
            Violation::NotInitialized => "not_initialized",
            Violation::ThreadLimit => "thread_limit",
            Violation::RateLimited => "rate_limited",
            Violation::CapacityExhausted => "capacity_exhausted",
            Violation::DoubleRelease => "double_release",
            Violation::StaleHandle => "stale_handle",
            Violation::InvalidHandle => "invalid_handle",
            Violation::ForeignThread => "foreign_thread",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub(crate) struct SecurityCounters {
    total: AtomicU64,
    not_initialized: AtomicU64,
    thread_limit: AtomicU64,
    rate_limited: AtomicU64,
    capacity: AtomicU64,
    double_release: AtomicU64,
    stale_handle: AtomicU64,
    invalid_handle: AtomicU64,
    foreign_thread: AtomicU64,
    pub secure_clears: AtomicU64,
}

impl SecurityCounters {
    pub fn record(&self, violation: Violation) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match violation {
            Violation::NotInitialized => &self.not_initialized,
            Violation::ThreadLimit => &self.thread_limit,
            Violation::RateLimited => &self.rate_limited,
            Violation::CapacityExhausted => &self.capacity,
            Violation::DoubleRelease => &self.double_release,
            Violation::StaleHandle => &self.stale_handle,
            Violation::InvalidHandle => &self.invalid_handle,
            Violation::ForeignThread => &self.foreign_thread,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SecurityStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SecurityStats {
            total_violations: load(&self.total),
            not_initialized_denials: load(&self.not_initialized),
            thread_limit_denials: load(&self.thread_limit),
            rate_limit_denials: load(&self.rate_limited),
            capacity_denials: load(&self.capacity),
            double_release_attempts: load(&self.double_release),
            stale_handle_uses: load(&self.stale_handle),
            invalid_handle_uses: load(&self.invalid_handle),
            foreign_thread_uses: load(&self.foreign_thread),
            secure_clears: load(&self.secure_clears),
        }
    }
}

/// Auditable security counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub total_violations: u64,
    pub not_initialized_denials: u64,
    pub thread_limit_denials: u64,
    pub rate_limit_denials: u64,
    pub capacity_denials: u64,
    pub double_release_attempts: u64,
    pub stale_handle_uses: u64,
    pub invalid_handle_uses: u64,
    pub foreign_thread_uses: u64,
    pub secure_clears: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub allocations: AtomicU64,
    pub deallocations: AtomicU64,
    pub active: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub steals: AtomicU64,
    pub chunk_grows: AtomicU64,
}

/// Capacity and traffic snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub max_slots: usize,
    pub chunks: usize,
    pub mapped_bytes: usize,
    pub active: u64,
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub steals: u64,
    pub chunk_grows: u64,
    pub threads: usize,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.active as f64 / self.capacity as f64
        }
    }
}

pub(crate) fn render_audit(pool: &PoolStats, security: &SecurityStats, active: bool) -> String {
    let lines = vec![
        "=== VM Slot Pool Security Audit ===".to_string(),
        format!("Pool state: {}", if active { "active" } else { "shut down" }),
        format!(
            "Slots: {} active / {} capacity / {} max ({:.1}% utilised, {} chunks)",
            pool.active,
            pool.capacity,
            pool.max_slots,
            pool.utilization() * 100.0,
            pool.chunks
        ),
        format!(
            "Traffic: {} acquired, {} released, {} cache hits, {} steals, {} threads",
            pool.total_allocations,
            pool.total_deallocations,
            pool.cache_hits,
            pool.steals,
            pool.threads
        ),
        format!("Total violations: {}", security.total_violations),
        format!("  Not initialized: {}", security.not_initialized_denials),
        format!("  Per-thread limit: {}", security.thread_limit_denials),
        format!("  Rate limited: {}", security.rate_limit_denials),
        format!("  Capacity exhausted: {}", security.capacity_denials),
        format!("  Double release: {}", security.double_release_attempts),
        format!("  Stale handle: {}", security.stale_handle_uses),
        format!("  Invalid handle: {}", security.invalid_handle_uses),
        format!("  Foreign thread: {}", security.foreign_thread_uses),
        format!("Secure clears: {}", security.secure_clears),
    ];
    lines.join("\n")
}
