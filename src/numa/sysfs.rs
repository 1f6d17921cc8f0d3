//! Sysfs node directory parsing

use std::fs;
use std::path::Path;

pub(super) struct NodeEntry {
    pub id: usize,
    pub cpus: Vec<usize>,
    pub memory_bytes: u64,
}

/// Collect every `nodeN` directory under `root` with `N < max_nodes`
pub(super) fn scan(root: &Path, max_nodes: usize) -> Vec<NodeEntry> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut nodes: Vec<NodeEntry> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = name.to_str()?.strip_prefix("node")?.parse::<usize>().ok()?;
            if id >= max_nodes {
                return None;
            }
            let dir = entry.path();
            let cpus = fs::read_to_string(dir.join("cpulist"))
                .map(|s| parse_cpu_list(&s))
                .unwrap_or_default();
            let memory_bytes = fs::read_to_string(dir.join("meminfo"))
                .ok()
                .and_then(|s| parse_mem_total(&s))
                .unwrap_or(0);
            Some(NodeEntry {
                id,
                cpus,
                memory_bytes,
            })
        })
        .collect();

    nodes.sort_by_key(|n| n.id);
    nodes
}

/// Parse a kernel cpulist such as `0-3,8,10-11`.
///
/// Malformed ranges are skipped rather than failing the whole list.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    if lo <= hi {
                        cpus.extend(lo..=hi);
                    }
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

/// `MemTotal` from a node meminfo file, in bytes
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (_, rest) = line.split_once("MemTotal:")?;
        let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        kb.checked_mul(1024)
    })
}
