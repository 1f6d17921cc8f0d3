//! Bump pointer allocation - O(1) fast path
//!
//! The cursor is an offset into a fixed region, advanced by CAS so that a
//! racing reader (teardown, stats) never sees a torn or overlapping bump.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic bump cursor over `[0, limit)`
#[derive(Debug)]
pub struct BumpCursor {
    offset: AtomicUsize,
    limit: usize,
}

impl BumpCursor {
    #[inline]
    pub const fn new(limit: usize) -> Self {
        Self {
            offset: AtomicUsize::new(0),
            limit,
        }
    }

    /// Claim `size` bytes, returning the offset of the claimed range.
    ///
    /// Returns `None` if the region is exhausted (caller handles slow path).
    #[inline(always)]
    pub fn try_bump(&self, size: usize) -> Option<usize> {
        let mut current = self.offset.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(size)?;
            if next > self.limit {
                return None;
            }
            match self.offset.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Rewind to the start of the region
    #[inline]
    pub fn rewind(&self) {
        self.offset.store(0, Ordering::Release);
    }

    /// Bytes handed out so far
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    /// Remaining capacity
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exhaustion() {
        let cursor = BumpCursor::new(128);
        assert_eq!(cursor.try_bump(64), Some(0));
        assert_eq!(cursor.try_bump(64), Some(64));
        assert_eq!(cursor.try_bump(1), None);
        assert_eq!(cursor.remaining(), 0);

        cursor.rewind();
        assert_eq!(cursor.used(), 0);
        assert_eq!(cursor.try_bump(128), Some(0));
    }

    #[test]
    fn test_overflowing_request() {
        let cursor = BumpCursor::new(128);
        cursor.try_bump(64);
        assert_eq!(cursor.try_bump(usize::MAX), None);
        assert_eq!(cursor.used(), 64);
    }

    #[test]
    fn test_concurrent_bumps_never_overlap() {
        let cursor = Arc::new(BumpCursor::new(64 * 4 * 256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cursor = Arc::clone(&cursor);
                thread::spawn(move || {
                    (0..256)
                        .filter_map(|_| cursor.try_bump(64))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut offsets: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 4 * 256);
    }

    proptest! {
        #[test]
        fn bumps_are_monotonic(sizes in proptest::collection::vec(1usize..512, 1..64)) {
            let cursor = BumpCursor::new(16 * 1024);
            let mut last_end = 0;
            for size in sizes {
                if let Some(offset) = cursor.try_bump(size) {
                    prop_assert!(offset >= last_end);
                    last_end = offset + size;
                }
            }
            prop_assert!(cursor.used() <= cursor.limit());
        }
    }
}
