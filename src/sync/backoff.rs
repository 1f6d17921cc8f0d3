//! Bounded retry with exponential backoff
//!
//! Wraps `crossbeam::utils::Backoff` so callers only describe a single CAS
//! attempt. Backoff starts with `spin_loop` hints and escalates to
//! `yield_now` once spinning stops paying off.

use crossbeam::utils::Backoff;

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<T> {
    /// CAS won, carry the result out
    Won(T),
    /// Another thread won the race, try again
    Lost,
    /// Nothing to retry for (empty list, full cache, ...)
    GiveUp,
}

/// Run `op` until it wins, gives up, or `budget` attempts are spent.
///
/// Returns `None` on give-up or when the budget runs out. A zero budget
/// still makes one attempt.
#[inline]
pub fn retry_bounded<T>(budget: u32, mut op: impl FnMut() -> Attempt<T>) -> Option<T> {
    let backoff = Backoff::new();
    let mut remaining = budget.max(1);
    loop {
        match op() {
            Attempt::Won(value) => return Some(value),
            Attempt::GiveUp => return None,
            Attempt::Lost => {
                remaining -= 1;
                if remaining == 0 {
                    return None;
                }
                backoff.snooze();
            }
        }
    }
}

/// Run `op` until it produces a value.
///
/// For operations that always make progress eventually (a push onto a
/// stack whose head keeps moving), where dropping the work is not an option.
#[inline]
pub fn retry_until<T>(mut op: impl FnMut() -> Option<T>) -> T {
    let backoff = Backoff::new();
    loop {
        if let Some(value) = op() {
            return value;
        }
        backoff.spin();
    }
}
