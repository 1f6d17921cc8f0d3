//! Building a runtime from configuration files and synthetic topologies

use ember_runtime::numa::{self, NodeId, Topology};
use ember_runtime::{ConfigError, ObjectKind, Runtime, RuntimeConfig};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

fn write_node(root: &Path, id: usize, cpus: &str, mem_kb: u64) {
    let dir = root.join(format!("node{}", id));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("cpulist"), format!("{}\n", cpus)).unwrap();
    fs::write(
        dir.join("meminfo"),
        format!("Node {} MemTotal:       {} kB\nNode {} MemFree: 1 kB\n", id, mem_kb, id),
    )
    .unwrap();
}

fn two_node_tree() -> TempDir {
    let root = TempDir::new().unwrap();
    write_node(root.path(), 0, "0-3", 1024);
    write_node(root.path(), 1, "4-7", 2048);
    fs::create_dir_all(root.path().join("possible")).unwrap();
    root
}

const SMALL_RUNTIME: &str = r#"
[memory]
default_block_size = 262144
huge_pages = false
pressure_threshold = 4096

[pool]
initial_slots = 4
chunk_size = 4
max_slots = 8
max_slots_per_thread = 4

[logging]
level = "warn"
"#;

#[test]
fn runtime_from_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SMALL_RUNTIME.as_bytes()).unwrap();
    let config = RuntimeConfig::from_file(file.path()).unwrap();

    let runtime: Runtime = Runtime::with_topology(&config, Arc::new(Topology::single_node())).unwrap();
    assert_eq!(runtime.pool.capacity(), 4);
    assert_eq!(runtime.memory.config().pressure_threshold, 4096);

    let ptr = runtime.memory.allocate_object(5000, ObjectKind::Object).unwrap();
    assert!(runtime.memory.check_pressure());
    unsafe { runtime.memory.free_object(ptr, 5000, ObjectKind::Object).unwrap() };
    assert!(!runtime.memory.check_pressure());

    let handle = runtime.pool.acquire().unwrap();
    runtime.pool.release(handle).unwrap();
    runtime.shutdown();
    assert!(runtime.pool.acquire().is_err());
}

#[test]
fn bad_file_is_reported() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[pool]\nmax_slots = \"many\"").unwrap();
    assert!(matches!(
        RuntimeConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[pool]\nmax_slots_per_thread = 0").unwrap();
    match RuntimeConfig::from_file(file.path()) {
        Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "max_slots_per_thread"),
        other => panic!("expected invalid field, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn topology_from_synthetic_sysfs() {
    let root = two_node_tree();
    let topology = Topology::from_sysfs(root.path());

    assert!(topology.is_available());
    assert_eq!(topology.node_count(), 2);
    assert_eq!(topology.node_of_cpu(5), NodeId::new(1));
    assert_eq!(topology.node_cpu_set(NodeId::new(0)), &[0, 1, 2, 3]);
    assert_eq!(topology.node_memory(NodeId::new(1)), 2048 * 1024);
    assert!(!topology.contains(NodeId::new(2)));
}

#[test]
fn numa_aware_runtime_on_two_nodes() {
    let root = two_node_tree();
    let topology = Arc::new(Topology::from_sysfs(root.path()));
    let mut config = RuntimeConfig::parse(SMALL_RUNTIME).unwrap();
    config.memory.numa_aware = true;

    let runtime: Runtime = Runtime::with_topology(&config, Arc::clone(&topology)).unwrap();
    let allocator = runtime.memory.allocator(ObjectKind::Array);
    let a = allocator.allocate_on_node(100_000, NodeId::new(1)).unwrap();
    let b = allocator.allocate_on_node(100_000, NodeId::new(0)).unwrap();
    assert_ne!(a, b);
    // One arena per (thread, node)
    assert_eq!(allocator.stats().thread_arenas, 2);
    assert!(allocator.check_integrity());
    assert!(runtime.memory.check_integrity());
}

#[test]
fn missing_sysfs_falls_back_to_one_node() {
    let root = TempDir::new().unwrap();
    let topology = Topology::from_sysfs(&root.path().join("absent"));
    assert!(!topology.is_available());
    assert_eq!(topology.node_count(), 1);
    assert_eq!(topology.node_of_cpu(123), NodeId::ZERO);

    // Process topology is memoised
    assert!(Arc::ptr_eq(&numa::detect(), &numa::detect()));
}
