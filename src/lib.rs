//! Ember Runtime - concurrent memory backbone for a bytecode interpreter
//!
//! Provides a tiered NUMA-aware allocator (thread arenas, lock-free slabs,
//! tracked large objects) and a secure lock-free pool of reusable runtime
//! instances ("VM slots").

pub mod allocator;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod numa;
pub mod os;
pub mod pool;
pub mod sync;

// Re-export core types
pub use allocator::{Allocator, AllocatorStats, Route, ThreadAllocator};
pub use config::{LoggingConfig, MemoryConfig, PoolConfig, RuntimeConfig};
pub use context::{MemoryContext, MemoryStats, ObjectKind, PressureEvent};
pub use error::{ConfigError, FreeError};
pub use numa::{NodeId, Topology};
pub use pool::{
    AcquireError, HandleError, PoolStats, PooledInstance, RuntimeInstance, SecurityStats,
    SlotHandle, VmLease, VmSlotPool,
};

use std::sync::Arc;

/// Memory context plus VM-slot pool, built from one [`RuntimeConfig`]
pub struct Runtime<T: PooledInstance = RuntimeInstance> {
    pub memory: MemoryContext,
    pub pool: VmSlotPool<T>,
    topology: Arc<Topology>,
}

impl<T: PooledInstance> Runtime<T> {
    /// Build against the process topology
    pub fn new(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        Self::with_topology(config, numa::detect())
    }

    pub fn with_topology(config: &RuntimeConfig, topology: Arc<Topology>) -> Result<Self, ConfigError> {
        config.validate()?;
        logging::log_runtime_init(topology.node_count(), topology.is_available());
        Ok(Self {
            memory: MemoryContext::with_topology(&config.memory, Arc::clone(&topology))?,
            pool: VmSlotPool::new(config.pool.clone())?,
            topology,
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Stop the pool and log the final state. Memory is released on drop.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        logging::log_runtime_shutdown();
    }
}
