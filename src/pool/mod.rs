//! Secure VM-slot pool - lock-free checkout of reusable runtime instances
//!
//! Design: slots live in page-aligned chunks published through a fixed
//! array of atomic pointers, so a handle's index resolves in O(1). A slot
//! moves `Free -> Allocated -> Releasing -> Free | Cached` through CAS on a
//! word that also carries its generation:
//! - acquire wins `Free`/`Cached -> Allocated` at the current generation
//! - release wins `Allocated -> Releasing` at the handle's generation, wipes
//!   the instance, then publishes the next generation
//!
//! Every refusal (shut down, per-thread cap, rate limit, exhaustion, bad
//! handle) is counted in [`SecurityStats`] and returned, never fatal.

mod error;
mod instance;
mod rate_limit;
mod slot;
mod stats;
mod thread;


pub use error::{AcquireError, HandleError};
pub use instance::{
    secure_zero, secure_zero_bytes, PooledInstance, RuntimeInstance, DEFAULT_LOCAL_WORDS,
    DEFAULT_STACK_WORDS,
};
pub use rate_limit::RateLimiter;
pub use slot::{SlotHandle, SlotState};
pub use stats::{PoolStats, SecurityStats, Violation};
pub use thread::ThreadPoolStats;

use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::logging;
use crate::sync::{retry_bounded, retry_until, Attempt, VersionedIndex};
use crossbeam::utils::Backoff;
use dashmap::DashMap;
use slot::{Slot, SlotChunk, SlotWord};
use stats::{PoolCounters, SecurityCounters};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self as std_thread, ThreadId};
use std::time::Instant;
use thread::ThreadState;
use tracing::{debug, info, warn};

const STATUS_ACTIVE: u8 = 1;
const STATUS_SHUT_DOWN: u8 = 2;

/// CAS attempts on a thread cache head before moving on
const CACHE_RETRY_BUDGET: u32 = 16;

/// Lock-free pool of `T` instances checked out by handle
pub struct VmSlotPool<T: PooledInstance = RuntimeInstance> {
    config: PoolConfig,
    /// Chunk `i` holds indices `i * chunk_size ..`; a non-null prefix
    chunks: Box<[AtomicPtr<SlotChunk<T>>]>,
    chunk_count: AtomicUsize,
    capacity: AtomicUsize,
    mapped_bytes: AtomicUsize,
    threads: DashMap<ThreadId, Arc<ThreadState>>,
    next_serial: AtomicU64,
    status: AtomicU8,
    epoch: Instant,
    counters: PoolCounters,
    security: SecurityCounters,
    _marker: PhantomData<T>,
}

// SAFETY: chunks are owned by the pool and only freed in Drop; slots
// enforce exclusive payload access through their state word
unsafe impl<T: PooledInstance> Send for VmSlotPool<T> {}
unsafe impl<T: PooledInstance> Sync for VmSlotPool<T> {}

impl<T: PooledInstance> VmSlotPool<T> {
    /// Build a pool and pre-map `initial_slots` slots
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let max_chunks = config.max_slots.div_ceil(config.chunk_size);

        let pool = Self {
            chunks: (0..max_chunks)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            chunk_count: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            mapped_bytes: AtomicUsize::new(0),
            threads: DashMap::new(),
            next_serial: AtomicU64::new(1),
            status: AtomicU8::new(STATUS_ACTIVE),
            epoch: Instant::now(),
            counters: PoolCounters::default(),
            security: SecurityCounters::default(),
            _marker: PhantomData,
            config,
        };

        while pool.capacity() < pool.config.initial_slots {
            if !pool.grow() {
                return Err(ConfigError::invalid(
                    "initial_slots",
                    "could not map the initial slot chunks",
                ));
            }
        }

        info!(
            event = "pool_init",
            capacity = pool.capacity(),
            max_slots = pool.config.max_slots,
            chunk_size = pool.config.chunk_size,
            "VM slot pool initialized"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_ACTIVE
    }

    /// Stop handing out slots. Outstanding handles can still be released.
    pub fn shutdown(&self) {
        if self.status.swap(STATUS_SHUT_DOWN, Ordering::AcqRel) == STATUS_ACTIVE {
            info!(
                event = "pool_shutdown",
                active = self.counters.active.load(Ordering::Relaxed),
                "VM slot pool shutting down"
            );
        }
    }

    #[inline]
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    // ===== Thread registry =====

    fn thread_state(&self) -> Arc<ThreadState> {
        let id = std_thread::current().id();
        if let Some(state) = self.threads.get(&id) {
            return Arc::clone(state.value());
        }
        // Exited threads are dropped before the registry grows
        self.prune_threads();
        let state = self
            .threads
            .entry(id)
            .or_insert_with(|| {
                Arc::new(ThreadState::new(
                    self.next_serial.fetch_add(1, Ordering::Relaxed),
                    id,
                    self.config.rate_limit_window(),
                    self.config.rate_limit_quota,
                ))
            });
        Arc::clone(state.value())
    }

    /// Handle for the calling thread; cheaper than the pool-level methods
    /// when making many calls
    pub fn thread(&self) -> PoolThread<'_, T> {
        PoolThread {
            pool: self,
            state: self.thread_state(),
            _not_send: PhantomData,
        }
    }

    /// Return the calling thread's cached slots to the shared chunks.
    ///
    /// The thread keeps its registry entry, cap and rate-limit window; the
    /// entry is reclaimed by [`VmSlotPool::prune_threads`] after the thread
    /// exits.
    pub fn release_thread(&self) -> usize {
        let state = self.thread_state();
        self.flush_cache(&state)
    }

    /// Drop registry entries of exited threads, flushing their caches first.
    ///
    /// An exited thread that still holds slots keeps its entry, so the
    /// registry never exceeds live threads plus `max_slots`. Runs on every
    /// new thread registration; returns the number of entries removed.
    pub fn prune_threads(&self) -> usize {
        let mut removed = 0;
        self.threads.retain(|_, state| {
            if state.is_alive() {
                return true;
            }
            self.flush_cache(state);
            if state.active.load(Ordering::Acquire) > 0 {
                return true;
            }
            removed += 1;
            false
        });
        if removed > 0 {
            debug!(event = "pool_threads_pruned", removed = removed, "Exited threads dropped from registry");
        }
        removed
    }

    // ===== Slot lookup =====

    fn chunk(&self, index: usize) -> Option<&SlotChunk<T>> {
        let ptr = self.chunks.get(index)?.load(Ordering::Acquire);
        // SAFETY: published chunks live until the pool drops
        unsafe { ptr.as_ref() }
    }

    fn resolve(&self, index: u32) -> Option<(&SlotChunk<T>, &Slot<T>)> {
        let index = index as usize;
        let chunk = self.chunk(index / self.config.chunk_size)?;
        let slot = chunk.get(index % self.config.chunk_size)?;
        Some((chunk, slot))
    }

    /// Current state of slot `index`
    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.resolve(index).map(|(_, slot)| slot.load().state)
    }

    /// Whether `handle` still names a live checkout
    pub fn is_live(&self, handle: SlotHandle) -> bool {
        self.resolve(handle.index()).map_or(false, |(_, slot)| {
            slot.load() == SlotWord::new(handle.generation(), SlotState::Allocated)
        })
    }

    // ===== Growth =====

    /// Append one chunk; false when at capacity or the OS refuses
    fn grow(&self) -> bool {
        let chunk_size = self.config.chunk_size;
        let idx = self.chunk_count.load(Ordering::Acquire);
        if idx >= self.chunks.len() {
            return false;
        }
        let len = chunk_size.min(self.config.max_slots - idx * chunk_size);
        let chunk = match SlotChunk::<T>::new(len) {
            Some(chunk) => Box::into_raw(Box::new(chunk)),
            None => {
                warn!(event = "pool_chunk_failed", slots = len, "Slot chunk mapping refused");
                return false;
            }
        };

        let won = self.chunks[idx]
            .compare_exchange(ptr::null_mut(), chunk, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        // Winner or not, chunk idx is now published; move the count past it
        let _ = self
            .chunk_count
            .compare_exchange(idx, idx + 1, Ordering::AcqRel, Ordering::Acquire);

        if !won {
            // SAFETY: chunk was never published
            drop(unsafe { Box::from_raw(chunk) });
            return true;
        }

        // SAFETY: just published, never freed before drop
        let bytes = unsafe { (*chunk).mapped_bytes() };
        self.mapped_bytes.fetch_add(bytes, Ordering::Relaxed);
        let capacity = self.capacity.fetch_add(len, Ordering::AcqRel) + len;
        self.counters.chunk_grows.fetch_add(1, Ordering::Relaxed);
        logging::log_chunk_grown(idx, len, capacity);
        true
    }

    // ===== Thread cache =====

    fn cache_push(&self, state: &ThreadState, index: u32, slot: &Slot<T>) {
        state.cache_len.fetch_add(1, Ordering::AcqRel);
        retry_until(|| {
            let head = state.cache_head.load(Ordering::Acquire);
            slot.cache_next
                .store(head.index().unwrap_or(VersionedIndex::NIL), Ordering::Relaxed);
            state
                .cache_head
                .compare_exchange_weak(head, head.successor(index), Ordering::Release, Ordering::Relaxed)
                .ok()
        });
    }

    fn cache_pop(&self, state: &ThreadState) -> Option<u32> {
        let index = retry_bounded(CACHE_RETRY_BUDGET, || {
            let head = state.cache_head.load(Ordering::Acquire);
            let index = match head.index() {
                Some(index) => index,
                None => return Attempt::GiveUp,
            };
            let next = match self.resolve(index) {
                Some((_, slot)) => slot.cache_next.load(Ordering::Relaxed),
                None => return Attempt::GiveUp,
            };
            match state.cache_head.compare_exchange_weak(
                head,
                head.successor(next),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => Attempt::Won(index),
                Err(_) => Attempt::Lost,
            }
        })?;
        state.cache_len.fetch_sub(1, Ordering::AcqRel);
        Some(index)
    }

    /// Claim a slot popped from a cache
    fn claim_cached(&self, index: u32) -> Option<(u32, u32)> {
        let (_, slot) = self.resolve(index)?;
        let word = slot.load();
        (word.state == SlotState::Cached
            && slot.transition(word, word.with_state(SlotState::Allocated)))
        .then_some((index, word.generation))
    }

    fn flush_cache(&self, state: &ThreadState) -> usize {
        let mut flushed = 0;
        while let Some(index) = self.cache_pop(state) {
            if let Some((chunk, slot)) = self.resolve(index) {
                let word = slot.load();
                if word.state == SlotState::Cached {
                    chunk.free.fetch_add(1, Ordering::AcqRel);
                    slot.publish(word.with_state(SlotState::Free));
                    flushed += 1;
                }
            }
        }
        flushed
    }

    // ===== Acquire =====

    fn reject(&self, state: &ThreadState, violation: Violation) {
        self.security.record(violation);
        state.counters.violations.fetch_add(1, Ordering::Relaxed);
        logging::log_security_violation(violation.as_str(), state.serial);
    }

    fn acquire_for(&self, state: &ThreadState) -> Result<SlotHandle, AcquireError> {
        if !self.is_active() {
            self.reject(state, Violation::NotInitialized);
            return Err(AcquireError::NotInitialized);
        }
        if state.active.load(Ordering::Acquire) >= self.config.max_slots_per_thread {
            self.reject(state, Violation::ThreadLimit);
            return Err(AcquireError::ThreadLimit);
        }
        // Charged up front; refunded below if no slot is found
        let now = self.now_ns();
        if !state.limiter.check(now) {
            self.reject(state, Violation::RateLimited);
            return Err(AcquireError::RateLimited);
        }

        let cached = std::iter::from_fn(|| self.cache_pop(state)).find_map(|i| self.claim_cached(i));
        let claimed = match cached {
            Some(claimed) => {
                state.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(claimed)
            }
            None => {
                state.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.scan(state).or_else(|| self.steal(state))
            }
        };

        let (index, generation) = match claimed {
            Some(claimed) => claimed,
            None => {
                state.limiter.refund(now);
                self.reject(state, Violation::CapacityExhausted);
                return Err(AcquireError::Exhausted);
            }
        };

        let (_, slot) = self
            .resolve(index)
            .ok_or(AcquireError::Exhausted)?;
        slot.owner.store(state.serial, Ordering::Release);
        slot.usage_count.fetch_add(1, Ordering::Relaxed);
        slot.last_used.store(now, Ordering::Relaxed);
        slot.borrowed.store(false, Ordering::Relaxed);
        // SAFETY: the Allocated CAS made this thread the sole holder
        let instance = unsafe { slot.instance_mut() };
        if instance.is_none() {
            *instance = Some(T::create());
        }

        state.active.fetch_add(1, Ordering::AcqRel);
        state.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        Ok(SlotHandle::new(index, generation))
    }

    /// Scan chunks for a `Free` slot, growing when none is found
    fn scan(&self, state: &ThreadState) -> Option<(u32, u32)> {
        let backoff = Backoff::new();
        let chunk_size = self.config.chunk_size;
        for pass in 0..self.config.scan_retry_budget.max(1) {
            let count = self.chunk_count.load(Ordering::Acquire).max(1);
            let start = (state.serial as usize).wrapping_add(pass as usize) % count;
            for step in 0..count {
                let idx = (start + step) % count;
                let chunk = match self.chunk(idx) {
                    Some(chunk) => chunk,
                    None => continue,
                };
                if chunk.free.load(Ordering::Acquire) == 0 {
                    continue;
                }
                for (offset, slot) in chunk.slots().iter().enumerate() {
                    let word = slot.load();
                    if word.state == SlotState::Free
                        && slot.transition(word, word.with_state(SlotState::Allocated))
                    {
                        chunk.free.fetch_sub(1, Ordering::AcqRel);
                        let index = (idx * chunk_size + offset) as u32;
                        return Some((index, word.generation));
                    }
                }
            }
            if !self.grow() {
                backoff.snooze();
            }
        }
        None
    }

    /// Take a slot parked in another thread's cache
    fn steal(&self, state: &ThreadState) -> Option<(u32, u32)> {
        let victims: Vec<Arc<ThreadState>> = self
            .threads
            .iter()
            .filter(|entry| entry.value().serial != state.serial)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for victim in victims {
            while let Some(index) = self.cache_pop(&victim) {
                if let Some(claimed) = self.claim_cached(index) {
                    self.counters.steals.fetch_add(1, Ordering::Relaxed);
                    debug!(event = "pool_steal", from = victim.serial, to = state.serial, index = index);
                    return Some(claimed);
                }
            }
        }
        None
    }

    // ===== Release and access =====

    /// Check `handle` against its slot for the calling thread
    ///
    /// A handle one generation behind an unoccupied slot is the same
    /// handle released twice when `releasing`; otherwise it is stale.
    fn validate(
        &self,
        state: &ThreadState,
        handle: SlotHandle,
        releasing: bool,
    ) -> Result<(&SlotChunk<T>, &Slot<T>, SlotWord), HandleError> {
        let (chunk, slot) = match self.resolve(handle.index()) {
            Some(found) => found,
            None => {
                self.reject(state, Violation::InvalidHandle);
                return Err(HandleError::InvalidHandle);
            }
        };
        let word = slot.load();
        if word.generation != handle.generation() {
            let released_twice = releasing
                && word.state != SlotState::Allocated
                && word.generation == handle.generation().wrapping_add(1);
            if released_twice {
                self.reject(state, Violation::DoubleRelease);
                return Err(HandleError::DoubleRelease);
            }
            self.reject(state, Violation::StaleHandle);
            return Err(HandleError::StaleHandle);
        }
        if word.state != SlotState::Allocated {
            self.reject(state, Violation::DoubleRelease);
            return Err(HandleError::DoubleRelease);
        }
        if slot.owner.load(Ordering::Acquire) != state.serial {
            self.reject(state, Violation::ForeignThread);
            return Err(HandleError::ForeignThread);
        }
        Ok((chunk, slot, word))
    }

    fn release_for(&self, state: &ThreadState, handle: SlotHandle) -> Result<(), HandleError> {
        let (chunk, slot, word) = self.validate(state, handle, true)?;
        if slot.borrowed.load(Ordering::Acquire) {
            return Err(HandleError::Busy);
        }
        if !slot.transition(word, word.with_state(SlotState::Releasing)) {
            self.reject(state, Violation::DoubleRelease);
            return Err(HandleError::DoubleRelease);
        }

        // SAFETY: the Releasing CAS made this thread the sole holder
        if let Some(instance) = unsafe { slot.instance_mut() } {
            instance.secure_clear();
        }
        fence(Ordering::SeqCst);
        self.security.secure_clears.fetch_add(1, Ordering::Relaxed);
        slot.owner.store(0, Ordering::Release);

        state.active.fetch_sub(1, Ordering::AcqRel);
        state.counters.deallocations.fetch_add(1, Ordering::Relaxed);

        let next = SlotWord::new(word.generation.wrapping_add(1), SlotState::Free);
        if state.cache_len.load(Ordering::Acquire) < self.config.thread_cache_size {
            slot.publish(next.with_state(SlotState::Cached));
            self.cache_push(state, handle.index(), slot);
        } else {
            chunk.free.fetch_add(1, Ordering::AcqRel);
            slot.publish(next);
        }

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn with_instance_for<R>(
        &self,
        state: &ThreadState,
        handle: SlotHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, HandleError> {
        let (_, slot, _) = self.validate(state, handle, false)?;
        if slot.borrowed.swap(true, Ordering::AcqRel) {
            return Err(HandleError::Busy);
        }
        // SAFETY: validated owner thread with the borrow flag held; the
        // instance was constructed at acquire
        let result = unsafe { slot.instance_mut() }.as_mut().map(f);
        slot.borrowed.store(false, Ordering::Release);
        result.ok_or(HandleError::InvalidHandle)
    }

    // ===== Convenience entry points for the calling thread =====

    /// Check out a slot for the calling thread
    pub fn acquire(&self) -> Result<SlotHandle, AcquireError> {
        self.acquire_for(&self.thread_state())
    }

    /// Return a slot; the instance is wiped before anyone else can see it
    pub fn release(&self, handle: SlotHandle) -> Result<(), HandleError> {
        self.release_for(&self.thread_state(), handle)
    }

    /// Run `f` against the checked-out instance
    pub fn with_instance<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, HandleError> {
        self.with_instance_for(&self.thread_state(), handle, f)
    }

    /// Check out a slot released automatically on drop
    pub fn lease(&self) -> Result<VmLease<'_, T>, AcquireError> {
        self.thread().lease()
    }

    // ===== Statistics =====

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            capacity: self.capacity(),
            max_slots: self.config.max_slots,
            chunks: self.chunk_count.load(Ordering::Acquire),
            mapped_bytes: self.mapped_bytes.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            total_allocations: c.allocations.load(Ordering::Relaxed),
            total_deallocations: c.deallocations.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            chunk_grows: c.chunk_grows.load(Ordering::Relaxed),
            threads: self.threads.len(),
        }
    }

    pub fn security_stats(&self) -> SecurityStats {
        self.security.snapshot()
    }

    /// Per-thread usage, ordered by thread serial
    pub fn thread_stats(&self) -> Vec<ThreadPoolStats> {
        let mut stats: Vec<_> = self.threads.iter().map(|e| e.value().stats()).collect();
        stats.sort_by_key(|s| s.serial);
        stats
    }

    /// Human-readable security audit
    pub fn audit_report(&self) -> String {
        stats::render_audit(&self.stats(), &self.security_stats(), self.is_active())
    }
}

impl<T: PooledInstance> Drop for VmSlotPool<T> {
    fn drop(&mut self) {
        let mut cleared = 0;
        for cell in self.chunks.iter() {
            let ptr = cell.swap(ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                continue;
            }
            // SAFETY: published via Box::into_raw in grow, reclaimed once here
            let mut chunk = unsafe { Box::from_raw(ptr) };
            cleared += chunk.clear_all();
        }
        debug!(event = "pool_teardown", instances_cleared = cleared, "VM slot pool dropped");
    }
}

/// Calling thread's handle on a [`VmSlotPool`]
pub struct PoolThread<'p, T: PooledInstance = RuntimeInstance> {
    pool: &'p VmSlotPool<T>,
    state: Arc<ThreadState>,
    _not_send: PhantomData<*const ()>,
}

impl<'p, T: PooledInstance> PoolThread<'p, T> {
    pub fn acquire(&self) -> Result<SlotHandle, AcquireError> {
        self.pool.acquire_for(&self.state)
    }

    pub fn release(&self, handle: SlotHandle) -> Result<(), HandleError> {
        self.pool.release_for(&self.state, handle)
    }

    pub fn with_instance<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, HandleError> {
        self.pool.with_instance_for(&self.state, handle, f)
    }

    /// Check out a slot whose instance is borrowed until the lease drops
    pub fn lease(&self) -> Result<VmLease<'p, T>, AcquireError> {
        let handle = self.acquire()?;
        let (_, slot) = self
            .pool
            .resolve(handle.index())
            .ok_or(AcquireError::Exhausted)?;
        slot.borrowed.store(true, Ordering::Release);
        // SAFETY: freshly acquired by this thread, instance constructed
        let instance = unsafe { slot.instance_mut() }.as_mut().map(NonNull::from);
        match instance {
            Some(instance) => Ok(VmLease {
                pool: self.pool,
                state: Arc::clone(&self.state),
                handle,
                instance,
                _not_send: PhantomData,
            }),
            None => {
                slot.borrowed.store(false, Ordering::Release);
                let _ = self.release(handle);
                Err(AcquireError::Exhausted)
            }
        }
    }

    /// Return this thread's cached slots to the global chunks
    pub fn flush_cache(&self) -> usize {
        self.pool.flush_cache(&self.state)
    }

    /// Slots this thread currently holds
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ThreadPoolStats {
        self.state.stats()
    }
}

/// Checked-out instance, released on drop
pub struct VmLease<'p, T: PooledInstance = RuntimeInstance> {
    pool: &'p VmSlotPool<T>,
    state: Arc<ThreadState>,
    handle: SlotHandle,
    instance: NonNull<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'p, T: PooledInstance> VmLease<'p, T> {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    fn unborrow(&self) {
        if let Some((_, slot)) = self.pool.resolve(self.handle.index()) {
            slot.borrowed.store(false, Ordering::Release);
        }
    }

    /// Keep the slot checked out and hand back its handle
    pub fn into_handle(self) -> SlotHandle {
        let this = ManuallyDrop::new(self);
        this.unborrow();
        // SAFETY: `this` is never dropped, so the Arc is released exactly once
        drop(unsafe { ptr::read(&this.state) });
        this.handle
    }
}

impl<'p, T: PooledInstance> Deref for VmLease<'p, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lease holds the slot and its borrow flag
        unsafe { self.instance.as_ref() }
    }
}

impl<'p, T: PooledInstance> DerefMut for VmLease<'p, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lease holds the slot and its borrow flag
        unsafe { self.instance.as_mut() }
    }
}

impl<'p, T: PooledInstance> Drop for VmLease<'p, T> {
    fn drop(&mut self) {
        self.unborrow();
        if let Err(e) = self.pool.release_for(&self.state, self.handle) {
            warn!(event = "lease_release_failed", handle = %self.handle, error = %e);
        }
    }
}
