//! Drive a mixed allocation and VM-slot workload, then print statistics

use ember_runtime::config::RuntimeConfig;
use ember_runtime::{logging, MemoryStats, ObjectKind, PoolStats, Runtime, SecurityStats};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone)]
struct CliConfig {
    config_path: Option<PathBuf>,
    threads: usize,
    ops: usize,
    json: Option<PathBuf>,
    print_default: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            threads: 4,
            ops: 10_000,
            json: None,
            print_default: false,
        }
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {} [OPTIONS]\n\nOptions:\n  \
         --config PATH     Runtime config (TOML); EMBER_CONFIG otherwise\n  \
         --threads N       Worker threads (default: 4)\n  \
         --ops N           Operations per worker (default: 10000)\n  \
         --json PATH       Write the final snapshot as JSON ('-' for stdout)\n  \
         --print-config    Print the default configuration and exit",
        program
    )
}

fn parse_args() -> Result<CliConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("ember-memstat");
    let mut config = CliConfig::default();
    let mut i = 1;

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config.config_path = Some(PathBuf::from(value(i, "--config")?));
            }
            "--threads" => {
                i += 1;
                config.threads = value(i, "--threads")?
                    .parse()
                    .map_err(|_| "Invalid value for --threads".to_string())?;
            }
            "--ops" => {
                i += 1;
                config.ops = value(i, "--ops")?
                    .parse()
                    .map_err(|_| "Invalid value for --ops".to_string())?;
            }
            "--json" => {
                i += 1;
                config.json = Some(PathBuf::from(value(i, "--json")?));
            }
            "--print-config" => config.print_default = true,
            "-h" | "--help" => return Err(usage(program)),
            arg => return Err(format!("Unknown option: {}\n\n{}", arg, usage(program))),
        }
        i += 1;
    }

    if config.threads == 0 {
        return Err("--threads must be at least 1".to_string());
    }
    Ok(config)
}

/// xorshift64*, enough to vary sizes without a dependency
struct SizeStream(u64);

impl SizeStream {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Mostly small objects, some medium, the odd large one
    fn size(&mut self) -> usize {
        let r = self.next();
        match r % 100 {
            0 => 600_000 + (r >> 8) as usize % 200_000,
            1..=9 => 70_000 + (r >> 8) as usize % 100_000,
            _ => 8 + (r >> 8) as usize % 2_000,
        }
    }

    fn kind(&mut self) -> ObjectKind {
        ObjectKind::ALL[(self.next() % ObjectKind::ALL.len() as u64) as usize]
    }
}

#[derive(Default)]
struct WorkloadTotals {
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    slot_cycles: AtomicU64,
    slot_refusals: AtomicU64,
}

fn run_worker(runtime: &Runtime, seed: u64, ops: usize, totals: &WorkloadTotals) {
    let mut stream = SizeStream(seed | 1);
    let mut live = Vec::new();
    let pool = runtime.pool.thread();

    for op in 0..ops {
        let size = stream.size();
        let kind = stream.kind();
        match runtime.memory.allocate_object(size, kind) {
            Some(ptr) => {
                totals.allocations.fetch_add(1, Ordering::Relaxed);
                live.push((ptr, size, kind));
            }
            None => {
                totals.failed_allocations.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Keep roughly half the objects alive
        if op % 2 == 1 {
            if let Some((ptr, size, kind)) = live.pop() {
                // SAFETY: allocated above with this size and kind, not used again
                if let Err(e) = unsafe { runtime.memory.free_object(ptr, size, kind) } {
                    tracing::warn!(event = "workload_free_failed", error = %e);
                }
            }
        }

        if op % 8 == 0 {
            match pool.lease() {
                Ok(mut vm) => {
                    vm.push(op as u64);
                    vm.set_local(0, seed);
                    vm.ip = op;
                    totals.slot_cycles.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    totals.slot_refusals.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    for (ptr, size, kind) in live {
        // SAFETY: still outstanding from the loop above
        let _ = unsafe { runtime.memory.free_object(ptr, size, kind) };
    }
    runtime.pool.release_thread();
}

#[derive(Serialize)]
struct Snapshot<'a> {
    threads: usize,
    ops_per_thread: usize,
    elapsed_ms: u128,
    workload_allocations: u64,
    workload_failed: u64,
    slot_cycles: u64,
    slot_refusals: u64,
    memory: &'a MemoryStats,
    pool: &'a PoolStats,
    security: &'a SecurityStats,
}

fn run(cli: CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    if cli.print_default {
        print!("{}", RuntimeConfig::generate_default());
        return Ok(());
    }

    let config = match &cli.config_path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::load()?,
    };
    logging::init_with_config(config.logging.to_log_config());

    let runtime: Runtime = Runtime::new(&config)?;
    let totals = WorkloadTotals::default();
    let start = Instant::now();

    std::thread::scope(|s| {
        for t in 0..cli.threads {
            let runtime = &runtime;
            let totals = &totals;
            let ops = cli.ops;
            s.spawn(move || {
                let _perf = logging::perf::track("memstat_worker");
                run_worker(runtime, 0x9E37_79B9_7F4A_7C15 ^ (t as u64 + 1), ops, totals);
            });
        }
    });
    let elapsed = start.elapsed();

    let memory = runtime.memory.statistics();
    let pool = runtime.pool.stats();
    let security = runtime.pool.security_stats();

    println!(
        "Workload: {} threads x {} ops in {:.2?} ({} allocations, {} failed, {} slot cycles, {} refused)",
        cli.threads,
        cli.ops,
        elapsed,
        totals.allocations.load(Ordering::Relaxed),
        totals.failed_allocations.load(Ordering::Relaxed),
        totals.slot_cycles.load(Ordering::Relaxed),
        totals.slot_refusals.load(Ordering::Relaxed),
    );
    println!();
    println!("{}", memory.report());
    for (name, stats) in [("objects", &memory.objects), ("strings", &memory.strings), ("vm", &memory.vm)] {
        println!();
        println!("[{}]", name);
        println!("{}", stats.report());
    }
    println!();
    println!("{}", runtime.pool.audit_report());

    if let Some(path) = &cli.json {
        let snapshot = Snapshot {
            threads: cli.threads,
            ops_per_thread: cli.ops,
            elapsed_ms: elapsed.as_millis(),
            workload_allocations: totals.allocations.load(Ordering::Relaxed),
            workload_failed: totals.failed_allocations.load(Ordering::Relaxed),
            slot_cycles: totals.slot_cycles.load(Ordering::Relaxed),
            slot_refusals: totals.slot_refusals.load(Ordering::Relaxed),
            memory: &memory,
            pool: &pool,
            security: &security,
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        if path.as_os_str() == "-" {
            println!("{}", json);
        } else {
            fs::write(path, json)?;
        }
    }

    runtime.shutdown();
    Ok(())
}

fn main() {
    let result = parse_args()
        .map_err(|e| -> Box<dyn std::error::Error> { e.into() })
        .and_then(run);
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
