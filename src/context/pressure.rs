//! Edge-triggered memory pressure signal

use crate::logging;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Delivered to the pressure callback on onset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PressureEvent {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub threshold_bytes: usize,
    /// 1 for the first crossing, 2 for the next, ...
    pub crossing: u64,
}

pub type PressureCallback = Arc<dyn Fn(&PressureEvent) + Send + Sync>;

pub(crate) struct PressureMonitor {
    threshold: usize,
    under: AtomicBool,
    crossings: AtomicU64,
    callback: RwLock<Option<PressureCallback>>,
}

impl PressureMonitor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            under: AtomicBool::new(false),
            crossings: AtomicU64::new(0),
            callback: RwLock::new(None),
        }
    }

    /// Update the flag from `current`; fires the callback only on the
    /// false -> true edge
    pub fn observe(&self, current: usize, peak: usize) -> bool {
        if current <= self.threshold {
            if self.under.swap(false, Ordering::AcqRel) {
                logging::log_pressure_relieved(current);
            }
            return false;
        }

        if !self.under.swap(true, Ordering::AcqRel) {
            let crossing = self.crossings.fetch_add(1, Ordering::AcqRel) + 1;
            logging::log_pressure_onset(current, self.threshold);
            // Clone out so the callback may replace itself
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                callback(&PressureEvent {
                    current_bytes: current,
                    peak_bytes: peak,
                    threshold_bytes: self.threshold,
                    crossing,
                });
            }
        }
        true
    }

    pub fn set_callback(&self, callback: Option<PressureCallback>) {
        *self.callback.write() = callback;
    }

    #[inline]
    pub fn is_under(&self) -> bool {
        self.under.load(Ordering::Acquire)
    }

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn crossings(&self) -> u64 {
        self.crossings.load(Ordering::Relaxed)
    }
}
