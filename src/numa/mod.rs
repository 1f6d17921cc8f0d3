//! NUMA topology - which CPUs and how much memory belong to which node
//!
//! Design: the table is built once per process from sysfs and never
//! mutated. When the platform exposes nothing, a single synthetic node owns
//! every CPU and all placement hints degrade to "node 0".

mod sysfs;

use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub use sysfs::parse_cpu_list;

/// Sysfs root scanned by [`detect`]
pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// Node count ceiling; nodes past it are ignored
pub const MAX_NUMA_NODES: usize = 64;

static TOPOLOGY: OnceCell<Arc<Topology>> = OnceCell::new();

/// NUMA node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(u16);

impl NodeId {
    /// Node 0, the answer whenever topology is unknown
    pub const ZERO: NodeId = NodeId(0);

    #[inline]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

type CpuSet = SmallVec<[usize; 16]>;

/// Read-only topology table
#[derive(Debug, Clone)]
pub struct Topology {
    available: bool,
    cpu_to_node: Vec<NodeId>,
    node_cpus: Vec<CpuSet>,
    node_memory: Vec<u64>,
}

impl Topology {
    /// One node holding every CPU the process can see
    pub fn single_node() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            available: false,
            cpu_to_node: vec![NodeId::ZERO; cpus],
            node_cpus: vec![(0..cpus).collect()],
            node_memory: vec![0],
        }
    }

    /// Build a synthetic topology from explicit per-node CPU lists
    pub fn from_node_cpus(nodes: Vec<Vec<usize>>) -> Self {
        if nodes.is_empty() {
            return Self::single_node();
        }
        let max_cpu = nodes.iter().flatten().copied().max().unwrap_or(0);
        let mut cpu_to_node = vec![NodeId::ZERO; max_cpu + 1];
        for (node, cpus) in nodes.iter().enumerate() {
            for &cpu in cpus {
                cpu_to_node[cpu] = NodeId::new(node as u16);
            }
        }
        Self {
            available: nodes.len() > 1,
            cpu_to_node,
            node_memory: vec![0; nodes.len()],
            node_cpus: nodes.into_iter().map(CpuSet::from_vec).collect(),
        }
    }

    /// Scan `root` laid out like `/sys/devices/system/node`.
    ///
    /// Missing or unreadable trees yield [`Topology::single_node`].
    pub fn from_sysfs(root: &Path) -> Self {
        let nodes = sysfs::scan(root, MAX_NUMA_NODES);
        if nodes.is_empty() {
            debug!(event = "numa_unavailable", root = %root.display(), "No NUMA nodes found");
            return Self::single_node();
        }

        let node_count = nodes.iter().map(|n| n.id).max().map_or(1, |m| m + 1);
        let mut node_cpus = vec![CpuSet::new(); node_count];
        let mut node_memory = vec![0u64; node_count];
        let mut cpu_to_node = Vec::new();

        for node in nodes {
            for &cpu in &node.cpus {
                if cpu >= cpu_to_node.len() {
                    cpu_to_node.resize(cpu + 1, NodeId::ZERO);
                }
                cpu_to_node[cpu] = NodeId::new(node.id as u16);
            }
            node_cpus[node.id] = node.cpus.into_iter().collect();
            node_memory[node.id] = node.memory_bytes;
        }

        Self {
            available: node_count > 1,
            cpu_to_node,
            node_cpus,
            node_memory,
        }
    }

    /// More than one node, so placement matters
    #[inline]
    pub fn is_available(&self) -> bool {
        self.available
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_cpus.len()
    }

    /// Node owning `cpu`; unknown CPUs map to node 0
    #[inline]
    pub fn node_of_cpu(&self, cpu: usize) -> NodeId {
        self.cpu_to_node.get(cpu).copied().unwrap_or(NodeId::ZERO)
    }

    /// CPUs local to `node`; empty for unknown nodes
    pub fn node_cpu_set(&self, node: NodeId) -> &[usize] {
        self.node_cpus
            .get(node.index())
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Memory behind `node` in bytes, 0 when unknown
    pub fn node_memory(&self, node: NodeId) -> u64 {
        self.node_memory.get(node.index()).copied().unwrap_or(0)
    }

    /// Node of the CPU the calling thread is running on right now
    #[inline]
    pub fn current_node(&self) -> NodeId {
        if !self.available {
            return NodeId::ZERO;
        }
        current_cpu().map_or(NodeId::ZERO, |cpu| self.node_of_cpu(cpu))
    }

    /// Whether `node` names a node in this table
    #[inline]
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.node_count()
    }
}

/// Process topology, detected on first call
pub fn detect() -> Arc<Topology> {
    TOPOLOGY
        .get_or_init(|| {
            let topology = Topology::from_sysfs(Path::new(SYSFS_NODE_ROOT));
            info!(
                event = "numa_detected",
                nodes = topology.node_count(),
                available = topology.is_available(),
                "NUMA topology detected"
            );
            Arc::new(topology)
        })
        .clone()
}

/// Node of the calling thread against the process topology
pub fn current_node() -> NodeId {
    detect().current_node()
}

/// CPUs of `node` in the process topology
pub fn node_cpu_set(node: NodeId) -> Vec<usize> {
    detect().node_cpu_set(node).to_vec()
}

/// CPU the calling thread is running on
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu has no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    (cpu >= 0).then_some(cpu as usize)
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}
