//! Per-thread acquisition rate limiter

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Fixed window: at most `quota` grants per `window`, counter reset when a
/// request arrives after the window has elapsed
#[derive(Debug)]
pub struct RateLimiter {
    window_start: AtomicU64,
    count: AtomicU32,
    window_ns: u64,
    quota: u32,
    denied: AtomicU64,
}

impl RateLimiter {
    pub fn new(window: Duration, quota: u32) -> Self {
        Self {
            window_start: AtomicU64::new(0),
            count: AtomicU32::new(0),
            window_ns: window.as_nanos().min(u64::MAX as u128) as u64,
            quota,
            denied: AtomicU64::new(0),
        }
    }

    /// Grant or deny one acquisition at `now_ns`
    pub fn check(&self, now_ns: u64) -> bool {
        let start = self.window_start.load(Ordering::Acquire);
        if now_ns.saturating_sub(start) >= self.window_ns
            && self
                .window_start
                .compare_exchange(start, now_ns, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }

        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= self.quota {
                self.denied.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back a grant from `check(now_ns)` that was not used. No-op
    /// once the window it was charged to has ended.
    pub fn refund(&self, now_ns: u64) {
        let start = self.window_start.load(Ordering::Acquire);
        if now_ns >= start && now_ns - start < self.window_ns {
            let _ = self
                .count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        }
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Grants used in the current window
    pub fn in_window(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_n_plus_one_denies_once() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 5);
        let granted = (0..6).filter(|i| limiter.check(10 + i)).count();
        assert_eq!(granted, 5);
        assert_eq!(limiter.denied(), 1);
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 2);
        assert!(limiter.check(10));
        assert!(limiter.check(20));
        assert!(!limiter.check(SEC - 1));
        assert!(limiter.check(SEC + 10));
        assert_eq!(limiter.in_window(), 1);
    }

    #[test]
    fn test_no_reset_inside_window() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 1);
        assert!(limiter.check(5 * SEC));
        assert!(!limiter.check(5 * SEC + SEC / 2));
        assert!(!limiter.check(6 * SEC - 1));
        assert!(limiter.check(6 * SEC));
    }

    #[test]
    fn test_refund_returns_grant_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 2);
        assert!(limiter.check(10));
        assert!(limiter.check(20));
        limiter.refund(20);
        assert_eq!(limiter.in_window(), 1);
        assert!(limiter.check(30));
        assert!(!limiter.check(40));

        // A refund after the window rolled over leaves the new window alone
        limiter.refund(2 * SEC);
        assert_eq!(limiter.in_window(), 2);
    }
}
