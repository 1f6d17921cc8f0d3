//! Error types shared across the memory subsystem
//!
//! Allocation itself never errors: it yields `None` (the null result) and the
//! caller decides whether to back off. The enums here cover the operations
//! that can be misused: configuration and explicit frees.

use std::fmt;

/// Configuration rejected before any OS call is made
#[derive(Debug)]
pub enum ConfigError {
    /// A field holds a value outside its valid range
    Invalid {
        field: &'static str,
        reason: String,
    },
    /// Config file could not be read
    Io(std::io::Error),
    /// Config text is not valid TOML for the schema
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid configuration for '{}': {}", field, reason)
            }
            ConfigError::Io(e) => write!(f, "failed to read configuration: {}", e),
            ConfigError::Parse(msg) => write!(f, "failed to parse configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Explicit free that the allocator could not honor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// Size maps to no size class and is below the large-object threshold
    UnknownSize(usize),
    /// Address was never handed out by the large-object tracker, or was
    /// already released
    UnknownLargeObject(usize),
    /// Slab-sized free of an address that is not an object in any slab
    NotOwned(usize),
    /// Object at `address` is smaller than the `size` being freed
    SizeMismatch { address: usize, size: usize },
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::UnknownSize(size) => {
                write!(f, "no size class serves {} bytes", size)
            }
            FreeError::UnknownLargeObject(addr) => {
                write!(f, "no large object is tracked at {:#x}", addr)
            }
            FreeError::NotOwned(addr) => {
                write!(f, "{:#x} is not a slab object of this allocator", addr)
            }
            FreeError::SizeMismatch { address, size } => {
                write!(f, "slab object at {:#x} is smaller than {} bytes", address, size)
            }
        }
    }
}

impl std::error::Error for FreeError {}
