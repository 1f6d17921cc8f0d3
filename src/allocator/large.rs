//! Large-object tracker - one mapping per object, located by address
//!
//! Large allocations are rare, so a short mutex-protected map is fine here.

use crate::error::FreeError;
use crate::numa::NodeId;
use crate::os::Mapping;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Default threshold above which requests bypass slabs and arenas
pub const LARGE_OBJECT_THRESHOLD: usize = 512 * 1024;

/// Metadata kept for each live large object
#[derive(Debug, Clone)]
pub struct LargeObjectRecord {
    pub address: usize,
    pub size: usize,
    pub mapped_bytes: usize,
    pub numa_node: Option<NodeId>,
    pub huge_pages: bool,
    pub created_at: Instant,
}

struct Tracked {
    record: LargeObjectRecord,
    _mapping: Mapping,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<usize, Tracked>,
    mapped_bytes: usize,
    node_objects: Vec<usize>,
    node_bytes: Vec<usize>,
}

/// Per-node share of large objects
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeUsage {
    pub objects: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LargeObjectStats {
    pub live_objects: usize,
    pub mapped_bytes: usize,
    pub allocations: u64,
    pub frees: u64,
    pub unknown_frees: u64,
    pub huge_page_objects: usize,
    pub per_node: Vec<NodeUsage>,
}

pub struct LargeObjectTracker {
    inner: Mutex<Inner>,
    huge_pages: bool,
    allocations: AtomicU64,
    frees: AtomicU64,
    unknown_frees: AtomicU64,
}

impl LargeObjectTracker {
    pub fn new(node_count: usize, huge_pages: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                node_objects: vec![0; node_count.max(1)],
                node_bytes: vec![0; node_count.max(1)],
                ..Inner::default()
            }),
            huge_pages,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            unknown_frees: AtomicU64::new(0),
        }
    }

    /// Map `size` bytes, preferring huge pages, bound to `node` if given
    pub fn alloc(&self, size: usize, node: Option<NodeId>) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let mapping = if self.huge_pages {
            Mapping::anonymous_prefer_huge(size)?
        } else {
            Mapping::anonymous(size, false)?
        };
        let numa_node = node.filter(|&n| mapping.bind_to_node(n));
        let ptr = NonNull::new(mapping.as_ptr())?;

        let record = LargeObjectRecord {
            address: mapping.start(),
            size,
            mapped_bytes: mapping.len(),
            numa_node,
            huge_pages: mapping.is_huge(),
            created_at: Instant::now(),
        };
        debug!(
            event = "large_alloc",
            size_bytes = size,
            mapped_bytes = record.mapped_bytes,
            huge_pages = record.huge_pages,
            node = ?numa_node,
            "Large object mapped"
        );

        let mut inner = self.inner.lock();
        inner.mapped_bytes += record.mapped_bytes;
        let slot = numa_node.map_or(0, |n| n.index());
        if slot < inner.node_objects.len() {
            inner.node_objects[slot] += 1;
            inner.node_bytes[slot] += record.mapped_bytes;
        }
        inner.objects.insert(
            record.address,
            Tracked {
                record,
                _mapping: mapping,
            },
        );
        drop(inner);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    /// Unmap the object at `ptr`, returning its requested size.
    ///
    /// Unknown (or already freed) addresses leave every counter untouched
    /// except `unknown_frees`.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<usize, FreeError> {
        let addr = ptr.as_ptr() as usize;
        let tracked = {
            let mut inner = self.inner.lock();
            let tracked = match inner.objects.remove(&addr) {
                Some(t) => t,
                None => {
                    drop(inner);
                    self.unknown_frees.fetch_add(1, Ordering::Relaxed);
                    warn!(event = "large_free_unknown", address = addr, "Free of untracked large object");
                    return Err(FreeError::UnknownLargeObject(addr));
                }
            };
            let record = &tracked.record;
            inner.mapped_bytes -= record.mapped_bytes;
            let slot = record.numa_node.map_or(0, |n| n.index());
            if slot < inner.node_objects.len() {
                inner.node_objects[slot] -= 1;
                inner.node_bytes[slot] -= record.mapped_bytes;
            }
            tracked
        };

        self.frees.fetch_add(1, Ordering::Relaxed);
        debug!(event = "large_free", address = addr, size_bytes = tracked.record.size, "Large object unmapped");
        // Mapping unmaps outside the lock
        Ok(tracked.record.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.inner.lock().objects.contains_key(&addr)
    }

    pub fn live_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Copy of every live record
    pub fn records(&self) -> Vec<LargeObjectRecord> {
        self.inner
            .lock()
            .objects
            .values()
            .map(|t| t.record.clone())
            .collect()
    }

    pub fn stats(&self) -> LargeObjectStats {
        let inner = self.inner.lock();
        LargeObjectStats {
            live_objects: inner.objects.len(),
            mapped_bytes: inner.mapped_bytes,
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            unknown_frees: self.unknown_frees.load(Ordering::Relaxed),
            huge_page_objects: inner.objects.values().filter(|t| t.record.huge_pages).count(),
            per_node: inner
                .node_objects
                .iter()
                .zip(&inner.node_bytes)
                .map(|(&objects, &bytes)| NodeUsage { objects, bytes })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let tracker = LargeObjectTracker::new(1, false);
        let ptr = tracker.alloc(600_000, None).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xCD, 600_000) };

        let stats = tracker.stats();
        assert_eq!(stats.live_objects, 1);
        assert!(stats.mapped_bytes >= 600_000);
        assert_eq!(stats.per_node[0].objects, 1);

        assert_eq!(tracker.free(ptr), Ok(600_000));
        assert_eq!(tracker.live_objects(), 0);
        assert_eq!(tracker.stats().mapped_bytes, 0);
    }

    #[test]
    fn test_double_free_is_reported_once() {
        let tracker = LargeObjectTracker::new(1, false);
        let ptr = tracker.alloc(1 << 20, None).unwrap();
        tracker.free(ptr).unwrap();

        let err = tracker.free(ptr).unwrap_err();
        assert_eq!(err, FreeError::UnknownLargeObject(ptr.as_ptr() as usize));
        let stats = tracker.stats();
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.unknown_frees, 1);
        assert_eq!(stats.per_node[0].objects, 0);
    }

    #[test]
    fn test_records_snapshot() {
        let tracker = LargeObjectTracker::new(2, true);
        let a = tracker.alloc(700_000, None).unwrap();
        let b = tracker.alloc(900_000, None).unwrap();
        let mut sizes: Vec<_> = tracker.records().iter().map(|r| r.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![700_000, 900_000]);
        assert!(tracker.contains(a.as_ptr() as usize));
        tracker.free(a).unwrap();
        tracker.free(b).unwrap();
    }
}
