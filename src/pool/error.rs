//! Slot pool error types

use std::fmt;

/// Why an acquire was refused. Every variant is soft: back off or scale
/// down, never crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Pool was shut down
    NotInitialized,
    /// Calling thread already holds its maximum number of slots
    ThreadLimit,
    /// Calling thread exceeded its acquisitions for the current window
    RateLimited,
    /// Every slot is taken and the pool is at capacity
    Exhausted,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NotInitialized => write!(f, "slot pool is not active"),
            AcquireError::ThreadLimit => write!(f, "per-thread slot limit reached"),
            AcquireError::RateLimited => write!(f, "acquisition rate limit exceeded"),
            AcquireError::Exhausted => write!(f, "slot pool exhausted"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Misuse of a [`SlotHandle`](super::SlotHandle) on release or access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// Handle names no slot this pool ever created
    InvalidHandle,
    /// Slot is not checked out (released twice)
    DoubleRelease,
    /// Slot was released and reused since the handle was issued
    StaleHandle,
    /// Slot is held by a different thread
    ForeignThread,
    /// Instance is currently borrowed on this thread
    Busy,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::InvalidHandle => write!(f, "handle does not name a pool slot"),
            HandleError::DoubleRelease => write!(f, "slot is not checked out"),
            HandleError::StaleHandle => write!(f, "handle refers to an earlier generation"),
            HandleError::ForeignThread => write!(f, "slot is owned by another thread"),
            HandleError::Busy => write!(f, "slot instance is currently borrowed"),
        }
    }
}

impl std::error::Error for HandleError {}
