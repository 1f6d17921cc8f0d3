//! Single-word ABA guards
//!
//! Both types pack an identity and a wrap-around counter into one `u64`,
//! so the lock-free heads built on them need nothing wider than
//! `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Address bits kept in a [`TaggedPtr`]. User-space addresses on x86-64 and
/// aarch64 fit in 48 bits.
#[cfg(target_pointer_width = "64")]
pub const ADDR_BITS: u32 = 48;
#[cfg(not(target_pointer_width = "64"))]
pub const ADDR_BITS: u32 = 32;

const ADDR_MASK: u64 = (1u64 << ADDR_BITS) - 1;

/// Address plus a tag bumped on every successful CAS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedPtr {
    addr: usize,
    tag: u64,
}

impl TaggedPtr {
    pub const NULL: TaggedPtr = TaggedPtr { addr: 0, tag: 0 };

    /// Whether `addr` survives packing
    #[inline]
    pub const fn fits(addr: usize) -> bool {
        (addr as u64) & !ADDR_MASK == 0
    }

    #[inline]
    pub fn new(addr: usize, tag: u64) -> Self {
        debug_assert!(Self::fits(addr), "address {:#x} exceeds tag layout", addr);
        Self {
            addr,
            tag: tag & (u64::MAX >> ADDR_BITS),
        }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.addr
    }

    #[inline]
    pub fn tag(self) -> u64 {
        self.tag
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.addr == 0
    }

    /// Same tag lineage, new address
    #[inline]
    pub fn successor(self, addr: usize) -> Self {
        Self::new(addr, self.tag.wrapping_add(1))
    }

    #[inline]
    fn pack(self) -> u64 {
        (self.tag << ADDR_BITS) | (self.addr as u64 & ADDR_MASK)
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            addr: (word & ADDR_MASK) as usize,
            tag: word >> ADDR_BITS,
        }
    }
}

/// Atomic cell holding a [`TaggedPtr`]
#[derive(Debug, Default)]
pub struct AtomicTaggedPtr(AtomicU64);

impl AtomicTaggedPtr {
    pub const fn null() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedPtr {
        TaggedPtr::unpack(self.0.load(order))
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedPtr,
        new: TaggedPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedPtr, TaggedPtr> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(TaggedPtr::unpack)
            .map_err(TaggedPtr::unpack)
    }
}

/// Slot index plus version, the head of a per-thread slot stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedIndex {
    index: u32,
    version: u32,
}

impl VersionedIndex {
    /// Sentinel index for an empty stack
    pub const NIL: u32 = u32::MAX;

    pub const EMPTY: VersionedIndex = VersionedIndex {
        index: Self::NIL,
        version: 0,
    };

    #[inline]
    pub const fn new(index: u32, version: u32) -> Self {
        Self { index, version }
    }

    #[inline]
    pub fn index(self) -> Option<u32> {
        (self.index != Self::NIL).then_some(self.index)
    }

    #[inline]
    pub fn version(self) -> u32 {
        self.version
    }

    #[inline]
    pub fn successor(self, index: u32) -> Self {
        Self::new(index, self.version.wrapping_add(1))
    }

    #[inline]
    fn pack(self) -> u64 {
        ((self.version as u64) << 32) | self.index as u64
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            index: word as u32,
            version: (word >> 32) as u32,
        }
    }
}

/// Atomic cell holding a [`VersionedIndex`]
#[derive(Debug)]
pub struct AtomicVersionedIndex(AtomicU64);

impl AtomicVersionedIndex {
    pub fn empty() -> Self {
        Self(AtomicU64::new(VersionedIndex::EMPTY.pack()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> VersionedIndex {
        VersionedIndex::unpack(self.0.load(order))
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: VersionedIndex,
        new: VersionedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<VersionedIndex, VersionedIndex> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(VersionedIndex::unpack)
            .map_err(VersionedIndex::unpack)
    }
}

impl Default for AtomicVersionedIndex {
    fn default() -> Self {
        Self::empty()
    }
}
