//! VM slots, slot handles, and slot chunks
//!
//! A slot's state and generation share one atomic word, so "still this
//! generation and still checked out" is a single CAS.

use crate::os::Mapping;
use serde::Serialize;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Lifecycle of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    /// Available in the global chunks
    Free,
    /// Checked out by exactly one thread
    Allocated,
    /// Being wiped by its releasing thread
    Releasing,
    /// Parked in a thread cache
    Cached,
}

impl SlotState {
    const fn bits(self) -> u32 {
        match self {
            SlotState::Free => 0,
            SlotState::Allocated => 1,
            SlotState::Releasing => 2,
            SlotState::Cached => 3,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => SlotState::Allocated,
            2 => SlotState::Releasing,
            3 => SlotState::Cached,
            _ => SlotState::Free,
        }
    }
}

/// `(generation, state)` as stored in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotWord {
    pub generation: u32,
    pub state: SlotState,
}

impl SlotWord {
    #[inline]
    pub const fn new(generation: u32, state: SlotState) -> Self {
        Self { generation, state }
    }

    #[inline]
    pub const fn with_state(self, state: SlotState) -> Self {
        Self::new(self.generation, state)
    }

    #[inline]
    const fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.state.bits() as u64
    }

    #[inline]
    const fn unpack(word: u64) -> Self {
        Self {
            generation: (word >> 32) as u32,
            state: SlotState::from_bits(word as u32),
        }
    }
}

/// Token naming one checkout of one slot
///
/// Handles are plain values. A handle outlives its checkout harmlessly: the
/// slot's generation moves on at release and the handle stops matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into one word for transport across an FFI or queue boundary
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}@{}", self.index, self.generation)
    }
}

/// One pool slot, padded to its own cache line
#[repr(C, align(64))]
pub(crate) struct Slot<T> {
    word: AtomicU64,
    /// Serial of the holding thread, 0 when not checked out
    pub owner: AtomicU64,
    pub usage_count: AtomicU64,
    /// Nanoseconds since pool start
    pub last_used: AtomicU64,
    /// Next index while parked in a thread cache
    pub cache_next: AtomicU32,
    /// Set while the holder has the instance borrowed
    pub borrowed: AtomicBool,
    instance: UnsafeCell<Option<T>>,
}

// SAFETY: the instance is only touched by the thread that won the slot's
// state CAS, and T itself can move between threads
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for Slot<T> {}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            word: AtomicU64::new(SlotWord::new(0, SlotState::Free).pack()),
            owner: AtomicU64::new(0),
            usage_count: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
            cache_next: AtomicU32::new(u32::MAX),
            borrowed: AtomicBool::new(false),
            instance: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn load(&self) -> SlotWord {
        SlotWord::unpack(self.word.load(Ordering::Acquire))
    }

    /// CAS `from -> to`; acquire on success so the previous holder's
    /// clearing is visible
    #[inline]
    pub fn transition(&self, from: SlotWord, to: SlotWord) -> bool {
        self.word
            .compare_exchange(from.pack(), to.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a state the caller exclusively holds the slot in
    #[inline]
    pub fn publish(&self, to: SlotWord) {
        self.word.store(to.pack(), Ordering::Release);
    }

    /// # Safety
    /// Caller must hold the slot exclusively (won it via CAS into
    /// `Allocated` or `Releasing`, or has `&mut` to the chunk).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn instance_mut(&self) -> &mut Option<T> {
        &mut *self.instance.get()
    }
}

/// Page-aligned run of slots from one mapping
pub(crate) struct SlotChunk<T> {
    mapping: Mapping,
    slots: NonNull<Slot<T>>,
    len: usize,
    /// Upper bound on slots currently `Free` in this chunk
    pub free: AtomicUsize,
}

// SAFETY: the chunk owns its slots; Slot<T> is Sync for T: Send
unsafe impl<T: Send> Send for SlotChunk<T> {}
unsafe impl<T: Send> Sync for SlotChunk<T> {}

impl<T> SlotChunk<T> {
    /// Map and initialise `len` slots; `None` on overflow or OS refusal
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let bytes = mem::size_of::<Slot<T>>().checked_mul(len)?;
        let mapping = Mapping::anonymous(bytes, false)?;
        if mapping.start() % mem::align_of::<Slot<T>>() != 0 {
            return None;
        }
        let slots = NonNull::new(mapping.as_ptr() as *mut Slot<T>)?;
        for i in 0..len {
            // SAFETY: i < len and the mapping holds len slots
            unsafe { slots.as_ptr().add(i).write(Slot::new()) };
        }
        Some(Self {
            mapping,
            slots,
            len,
            free: AtomicUsize::new(len),
        })
    }

    #[inline]
    pub fn slots(&self) -> &[Slot<T>] {
        // SAFETY: len slots were initialised in new and live until drop
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.len) }
    }

    #[inline]
    pub fn get(&self, offset: usize) -> Option<&Slot<T>> {
        self.slots().get(offset)
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapping.len()
    }
}

impl<T: super::PooledInstance> SlotChunk<T> {
    /// Wipe every constructed instance, in any state
    pub fn clear_all(&mut self) -> usize {
        let mut cleared = 0;
        for slot in self.slots() {
            // SAFETY: &mut self excludes every other slot user
            if let Some(instance) = unsafe { slot.instance_mut() } {
                instance.secure_clear();
                cleared += 1;
            }
        }
        cleared
    }
}

impl<T> Drop for SlotChunk<T> {
    fn drop(&mut self) {
        for i in 0..self.len {
            // SAFETY: each slot was initialised once and is dropped once;
            // the mapping is unmapped afterwards
            unsafe { std::ptr::drop_in_place(self.slots.as_ptr().add(i)) };
        }
    }
}
