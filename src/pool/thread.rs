//! Per-thread pool state: slot cache, active count, rate limiter
//!
//! A thread's state outlives every handle on it and is only dropped from the
//! registry once the OS thread has exited and holds no slots, so its cap and
//! rate-limit window cannot be reset from inside the thread.

use super::rate_limit::RateLimiter;
use crate::sync::AtomicVersionedIndex;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

/// Cleared by the thread-local destructor when the OS thread exits
struct Liveness(Arc<AtomicBool>);

impl Drop for Liveness {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

thread_local! {
    static LIVENESS: Liveness = Liveness(Arc::new(AtomicBool::new(true)));
}

/// Flag that stays true while the calling thread runs. Already false when
/// asked for during thread teardown.
fn liveness() -> Arc<AtomicBool> {
    LIVENESS
        .try_with(|l| Arc::clone(&l.0))
        .unwrap_or_else(|_| Arc::new(AtomicBool::new(false)))
}

#[derive(Debug, Default)]
pub(crate) struct ThreadCounters {
    pub allocations: AtomicU64,
    pub deallocations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub violations: AtomicU64,
}

/// State the pool keeps for every thread that has touched it
#[derive(Debug)]
pub(crate) struct ThreadState {
    /// Non-zero identifier stamped into slots this thread holds
    pub serial: u64,
    pub thread: ThreadId,
    alive: Arc<AtomicBool>,
    /// Versioned head of the cached-slot stack, linked through
    /// `Slot::cache_next`
    pub cache_head: CachePadded<AtomicVersionedIndex>,
    /// Upper bound on cached slots (incremented before a push lands)
    pub cache_len: AtomicUsize,
    pub active: AtomicUsize,
    pub limiter: RateLimiter,
    pub counters: ThreadCounters,
}

impl ThreadState {
    pub fn new(serial: u64, thread: ThreadId, window: Duration, quota: u32) -> Self {
        Self {
            serial,
            thread,
            alive: liveness(),
            cache_head: CachePadded::new(AtomicVersionedIndex::empty()),
            cache_len: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            limiter: RateLimiter::new(window, quota),
            counters: ThreadCounters::default(),
        }
    }

    /// Whether the OS thread this state belongs to is still running
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let c = &self.counters;
        ThreadPoolStats {
            serial: self.serial,
            active: self.active.load(Ordering::Relaxed),
            cached: self.cache_len.load(Ordering::Relaxed),
            allocations: c.allocations.load(Ordering::Relaxed),
            deallocations: c.deallocations.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            violations: c.violations.load(Ordering::Relaxed),
            rate_limited: self.limiter.denied(),
        }
    }
}

/// Snapshot of one thread's pool usage
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThreadPoolStats {
    pub serial: u64,
    pub active: usize,
    pub cached: usize,
    pub allocations: u64,
    pub deallocations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub violations: u64,
    pub rate_limited: u64,
}
