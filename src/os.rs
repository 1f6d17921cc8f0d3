//! OS memory acquisition - anonymous mappings and NUMA binding
//!
//! Everything that talks to the kernel lives here. Callers get a [`Mapping`]
//! that unmaps itself on drop.

use crate::numa::NodeId;
use once_cell::sync::Lazy;
use std::ptr::NonNull;
use tracing::debug;

/// Cache line the hot structures are padded and rounded to
pub const CACHE_LINE_SIZE: usize = 64;

/// Huge page size assumed for `MAP_HUGETLB` mappings
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Highest node id a bind request can name
pub const MAX_BIND_NODES: usize = 64;

static PAGE_SIZE: Lazy<usize> = Lazy::new(query_page_size);

static HUGE_PAGES: Lazy<bool> = Lazy::new(detect_huge_pages);

/// System page size, queried once
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Whether the kernel has huge pages reserved
#[inline]
pub fn huge_pages_available() -> bool {
    *HUGE_PAGES
}

/// Round `value` up to a multiple of `align` (a power of two), or `None` on
/// overflow
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

fn detect_huge_pages() -> bool {
    std::fs::read_to_string("/proc/sys/vm/nr_hugepages")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(false, |n| n > 0)
}

/// Anonymous read-write mapping owned by this value
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
}

// SAFETY: a Mapping is plain memory with no thread affinity
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes, rounded up to the page (or huge page) size.
    ///
    /// Returns `None` when the kernel refuses, including when huge pages were
    /// requested but none are reserved. Memory is zero-filled.
    pub fn anonymous(len: usize, huge: bool) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let granule = if huge { HUGE_PAGE_SIZE } else { page_size() };
        let len = align_up(len, granule)?;
        let ptr = sys::map(len, huge)?;
        Some(Self { ptr, len, huge })
    }

    /// Try a huge-page mapping first, fall back to standard pages
    pub fn anonymous_prefer_huge(len: usize) -> Option<Self> {
        if len >= HUGE_PAGE_SIZE && huge_pages_available() {
            if let Some(m) = Self::anonymous(len, true) {
                return Some(m);
            }
            debug!(
                event = "huge_page_fallback",
                size_bytes = len,
                "Huge page mapping refused, using standard pages"
            );
        }
        Self::anonymous(len, false)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_huge(&self) -> bool {
        self.huge
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Bind the pages to `node`. Returns false when the platform has no
    /// binding call or the kernel rejects it; the mapping stays usable.
    pub fn bind_to_node(&self, node: NodeId) -> bool {
        sys::bind(self.ptr, self.len, node)
    }

    /// Touch one byte per page so the pages are faulted in by this thread
    pub fn prefault(&self) {
        let step = page_size();
        let mut offset = 0;
        while offset < self.len {
            // SAFETY: offset < len, the page is mapped read-write
            unsafe { core::ptr::write_volatile(self.as_ptr().add(offset), 0) };
            offset += step;
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from sys::map and are unmapped exactly once
        unsafe { sys::unmap(self.ptr, self.len) };
    }
}

#[cfg(unix)]
mod sys {
    use super::*;

    #[cfg(target_os = "linux")]
    const HUGE_FLAGS: libc::c_int = libc::MAP_HUGETLB;
    #[cfg(not(target_os = "linux"))]
    const HUGE_FLAGS: libc::c_int = 0;

    pub(super) fn map(len: usize, huge: bool) -> Option<NonNull<u8>> {
        if huge && HUGE_FLAGS == 0 {
            return None;
        }
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= HUGE_FLAGS;
        }
        // SAFETY: anonymous mapping, no file descriptor involved
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
    }

    #[cfg(target_os = "linux")]
    pub(super) fn bind(ptr: NonNull<u8>, len: usize, node: NodeId) -> bool {
        const MPOL_BIND: libc::c_long = 2;

        let node = node.index();
        if node >= MAX_BIND_NODES {
            return false;
        }
        const WORD_BITS: usize = libc::c_ulong::BITS as usize;
        let mut mask = [0 as libc::c_ulong; MAX_BIND_NODES / WORD_BITS];
        mask[node / WORD_BITS] = 1 << (node % WORD_BITS);
        // SAFETY: the range is a live mapping owned by the caller and the
        // mask covers MAX_BIND_NODES bits
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr.as_ptr() as *mut libc::c_void,
                len as libc::c_ulong,
                MPOL_BIND,
                mask.as_ptr(),
                (MAX_BIND_NODES + 1) as libc::c_ulong,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            debug!(event = "numa_bind_failed", node = node, "mbind rejected");
        }
        rc == 0
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn bind(_ptr: NonNull<u8>, _len: usize, _node: NodeId) -> bool {
        false
    }
}

#[cfg(not(unix))]
mod sys {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub(super) fn map(len: usize, huge: bool) -> Option<NonNull<u8>> {
        if huge {
            return None;
        }
        let layout = Layout::from_size_align(len, page_size()).ok()?;
        // SAFETY: len is non-zero
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, page_size()) {
            dealloc(ptr.as_ptr(), layout);
        }
    }

    pub(super) fn bind(_ptr: NonNull<u8>, _len: usize, _node: NodeId) -> bool {
        false
    }
}
