//! Logging infrastructure - structured tracing throughout the memory core
//!
//! Events go through `tracing`; this module installs the subscriber:
//! - Zero cost on hot paths when disabled (trace level only)
//! - Slow paths and security events at debug/warn
//! - Console or non-blocking file output, plain or JSON

use once_cell::sync::OnceCell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Flushes the file writer until process exit
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "ember_runtime.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    /// Console output when `None`
    pub file: Option<PathBuf>,
    pub json: bool,
    /// Emit span enter/close events
    pub spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file: None,
            json: false,
            spans: false,
        }
    }
}

/// Level from its name, INFO when unrecognised
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

impl LogConfig {
    /// `EMBER_LOG_LEVEL`, `EMBER_LOG_FILE`, `EMBER_LOG_JSON`, `EMBER_LOG_SPANS`
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var_os(name).is_some();
        Self {
            level: std::env::var("EMBER_LOG_LEVEL")
                .map(|l| parse_level(&l))
                .unwrap_or(Level::INFO),
            file: std::env::var_os("EMBER_LOG_FILE").map(PathBuf::from),
            json: flag("EMBER_LOG_JSON"),
            spans: flag("EMBER_LOG_SPANS"),
        }
    }

    /// Errors only, for benchmarks and hot workloads
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Everything, spans included, to a local file
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            json: false,
            spans: true,
        }
    }
}

/// Install the subscriber described by the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Install a subscriber; only the first call in a process has any effect.
/// `RUST_LOG` overrides `config.level` when set.
pub fn init_with_config(config: LogConfig) {
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("ember_runtime={}", config.level).to_lowercase())
        });
        let spans = if config.spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = match (config.file.as_deref().map(file_writer), config.json) {
            (Some(writer), true) => fmt::layer().json().with_writer(writer).with_span_events(spans).boxed(),
            (Some(writer), false) => fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(writer)
                .with_span_events(spans)
                .boxed(),
            (None, true) => fmt::layer().json().with_writer(io::stdout).with_span_events(spans).boxed(),
            (None, false) => fmt::layer()
                .with_writer(io::stdout)
                .with_span_events(spans)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
                .boxed(),
        };

        // A host may have installed its own subscriber already
        let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
    });
}

fn file_writer(path: &Path) -> NonBlocking {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.into());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    let _ = FILE_GUARD.set(guard);
    writer
}

pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}

// ============================================================================
// Memory-subsystem event helpers
// ============================================================================

/// Log a refused allocation
#[inline]
pub fn log_allocation_failure(size: usize, path: &str) {
    use tracing::debug;
    debug!(
        event = "allocation_failed",
        size_bytes = size,
        path = path,
        "Allocation refused"
    );
}

/// Log a security violation detected by the slot pool
pub fn log_security_violation(kind: &str, thread_serial: u64) {
    use tracing::warn;
    warn!(
        event = "security_violation",
        violation = kind,
        thread = thread_serial,
        "Slot pool security violation"
    );
}

/// Log a new pool chunk
pub fn log_chunk_grown(chunk: usize, slots: usize, capacity: usize) {
    use tracing::debug;
    debug!(
        event = "pool_chunk_grown",
        chunk = chunk,
        slots = slots,
        capacity = capacity,
        "Slot pool chunk appended"
    );
}

/// Log memory pressure onset
pub fn log_pressure_onset(current_bytes: usize, threshold_bytes: usize) {
    use tracing::warn;
    warn!(
        event = "memory_pressure",
        current_bytes = current_bytes,
        threshold_bytes = threshold_bytes,
        "Memory usage crossed pressure threshold"
    );
}

/// Log memory pressure relief
pub fn log_pressure_relieved(current_bytes: usize) {
    use tracing::info;
    info!(
        event = "memory_pressure_relieved",
        current_bytes = current_bytes,
        "Memory usage back under pressure threshold"
    );
}

/// Log runtime initialization
pub fn log_runtime_init(nodes: usize, numa: bool) {
    use tracing::info;
    info!(
        event = "runtime_init",
        numa_nodes = nodes,
        numa_available = numa,
        "Ember memory runtime initializing"
    );
}

/// Log runtime shutdown
pub fn log_runtime_shutdown() {
    use tracing::info;
    info!(event = "runtime_shutdown", "Ember memory runtime shutting down");
}

/// Timing guards for coarse operations (worker runs, resets)
pub mod perf {
    use std::time::Instant;

    /// Logs `operation` and its duration at debug level when dropped
    #[must_use]
    pub fn track(operation: &'static str) -> OpTimer {
        OpTimer {
            operation,
            started: Instant::now(),
        }
    }

    pub struct OpTimer {
        operation: &'static str,
        started: Instant,
    }

    impl OpTimer {
        pub fn elapsed_us(&self) -> u128 {
            self.started.elapsed().as_micros()
        }
    }

    impl Drop for OpTimer {
        fn drop(&mut self) {
            tracing::debug!(
                event = "op_timed",
                operation = self.operation,
                elapsed_us = self.elapsed_us() as u64,
                "Operation finished"
            );
        }
    }
}
