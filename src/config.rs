//! Runtime configuration - applied at construction, immutable afterwards

use crate::allocator::{SizeClassLadder, DEFAULT_BLOCK_SIZE, LARGE_OBJECT_THRESHOLD};
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::os::CACHE_LINE_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a config file for [`RuntimeConfig::load`]
pub const CONFIG_ENV: &str = "EMBER_CONFIG";

/// Chunk size ceiling for the slot pool
pub const MAX_CHUNK_SIZE: usize = 1000;

/// Slot count ceiling (slot indices must fit in 32 bits)
pub const MAX_TOTAL_SLOTS: usize = 1 << 24;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_block_size")]
    pub default_block_size: usize,

    #[serde(default = "default_large_threshold")]
    pub large_object_threshold: usize,

    #[serde(default)]
    pub size_classes: SizeClassLadder,

    #[serde(default = "default_true")]
    pub huge_pages: bool,

    #[serde(default = "default_true")]
    pub numa_aware: bool,

    /// Touch every page of a new arena block on the allocating thread
    #[serde(default = "default_false")]
    pub prefault: bool,

    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: usize,

    #[serde(default = "default_slab_retry_budget")]
    pub slab_retry_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_initial_slots")]
    pub initial_slots: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    #[serde(default = "default_max_slots_per_thread")]
    pub max_slots_per_thread: usize,

    #[serde(default = "default_thread_cache_size")]
    pub thread_cache_size: usize,

    #[serde(default = "default_rate_window_ms")]
    pub rate_limit_window_ms: u64,

    #[serde(default = "default_rate_quota")]
    pub rate_limit_quota: u32,

    /// Full passes over the chunk list before growing
    #[serde(default = "default_scan_retry_budget")]
    pub scan_retry_budget: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub spans: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
            size_classes: SizeClassLadder::Standard,
            huge_pages: true,
            numa_aware: true,
            prefault: false,
            pressure_threshold: default_pressure_threshold(),
            slab_retry_budget: default_slab_retry_budget(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_slots: default_initial_slots(),
            chunk_size: default_chunk_size(),
            max_slots: default_max_slots(),
            max_slots_per_thread: default_max_slots_per_thread(),
            thread_cache_size: default_thread_cache_size(),
            rate_limit_window_ms: default_rate_window_ms(),
            rate_limit_quota: default_rate_quota(),
            scan_retry_budget: default_scan_retry_budget(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_block_size() -> usize { DEFAULT_BLOCK_SIZE }
fn default_large_threshold() -> usize { LARGE_OBJECT_THRESHOLD }
fn default_pressure_threshold() -> usize { 1024 * 1024 * 1024 }
fn default_slab_retry_budget() -> u32 { 64 }
fn default_initial_slots() -> usize { 64 }
fn default_chunk_size() -> usize { 16 }
fn default_max_slots() -> usize { 10_000 }
fn default_max_slots_per_thread() -> usize { 100 }
fn default_thread_cache_size() -> usize { 8 }
fn default_rate_window_ms() -> u64 { 1000 }
fn default_rate_quota() -> u32 { 1000 }
fn default_scan_retry_budget() -> u32 { 4 }
fn default_log_level() -> String { "info".to_string() }

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_block_size == 0 || self.default_block_size % CACHE_LINE_SIZE != 0 {
            return Err(ConfigError::invalid(
                "default_block_size",
                format!("must be a non-zero multiple of {}", CACHE_LINE_SIZE),
            ));
        }
        if self.large_object_threshold == 0 {
            return Err(ConfigError::invalid("large_object_threshold", "must be non-zero"));
        }
        if self.pressure_threshold == 0 {
            return Err(ConfigError::invalid("pressure_threshold", "must be non-zero"));
        }
        let classes = crate::allocator::SizeClasses::new(&self.size_classes)?;
        if classes.max_size() >= self.large_object_threshold {
            return Err(ConfigError::invalid(
                "large_object_threshold",
                format!("must exceed the largest size class ({} bytes)", classes.max_size()),
            ));
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::invalid(
                "chunk_size",
                format!("must be within 1..={}", MAX_CHUNK_SIZE),
            ));
        }
        if self.max_slots == 0 || self.max_slots > MAX_TOTAL_SLOTS {
            return Err(ConfigError::invalid(
                "max_slots",
                format!("must be within 1..={}", MAX_TOTAL_SLOTS),
            ));
        }
        if self.initial_slots > self.max_slots {
            return Err(ConfigError::invalid("initial_slots", "exceeds max_slots"));
        }
        if self.max_slots_per_thread == 0 {
            return Err(ConfigError::invalid("max_slots_per_thread", "must be non-zero"));
        }
        if self.rate_limit_window_ms == 0 {
            return Err(ConfigError::invalid("rate_limit_window_ms", "must be non-zero"));
        }
        if self.rate_limit_quota == 0 {
            return Err(ConfigError::invalid("rate_limit_quota", "must be non-zero"));
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

impl LoggingConfig {
    /// Logging setup described by this section
    pub fn to_log_config(&self) -> LogConfig {
        LogConfig {
            level: crate::logging::parse_level(&self.level),
            file: self.file.as_ref().map(std::path::PathBuf::from),
            json: self.json,
            spans: self.spans,
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from TOML text and validate it
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// File named by `EMBER_CONFIG`, or defaults when unset
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.memory.validate()?;
        self.pool.validate()
    }

    /// Default configuration as TOML text
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.memory.default_block_size, 2 * 1024 * 1024);
        assert_eq!(config.memory.large_object_threshold, 512 * 1024);
        assert_eq!(config.pool.initial_slots, 64);
        assert_eq!(config.pool.chunk_size, 16);
        assert_eq!(config.pool.max_slots, 10_000);
        assert_eq!(config.pool.max_slots_per_thread, 100);
        assert_eq!(config.pool.rate_limit_window(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[memory]
default_block_size = 1048576
size_classes = "fine"
huge_pages = false

[pool]
max_slots = 2
initial_slots = 0
max_slots_per_thread = 2

[logging]
level = "debug"
"#;
        let config = RuntimeConfig::parse(toml).unwrap();
        assert_eq!(config.memory.default_block_size, 1024 * 1024);
        assert_eq!(config.memory.size_classes, SizeClassLadder::Fine);
        assert!(!config.memory.huge_pages);
        assert!(config.memory.numa_aware);
        assert_eq!(config.pool.max_slots, 2);
        assert_eq!(config.pool.chunk_size, 16);
        assert_eq!(config.logging.to_log_config().level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_custom_ladder() {
        let toml = r#"
[memory]
size_classes = { custom = [16, 32, 48] }
"#;
        let config = RuntimeConfig::parse(toml).unwrap();
        assert_eq!(
            config.memory.size_classes,
            SizeClassLadder::Custom(vec![16, 32, 48])
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RuntimeConfig::parse("[pool]\nchunk_size = 0\n").is_err());
        assert!(RuntimeConfig::parse("[pool]\nchunk_size = 1001\n").is_err());
        assert!(RuntimeConfig::parse("[pool]\nrate_limit_quota = 0\n").is_err());
        assert!(RuntimeConfig::parse("[memory]\ndefault_block_size = 100\n").is_err());
        assert!(RuntimeConfig::parse("[memory]\nsize_classes = { custom = [24, 8] }\n").is_err());
        assert!(RuntimeConfig::parse("[pool]\nmax_slots = 4\ninitial_slots = 8\n").is_err());
        assert!(RuntimeConfig::parse("[memory]\nlarge_object_threshold = 65536\n").is_err());

        let err = RuntimeConfig::parse("[pool\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nthread_cache_size = 4").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.thread_cache_size, 4);

        let missing = RuntimeConfig::from_file(Path::new("/nonexistent/ember.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_generated_default_parses() {
        let text = RuntimeConfig::generate_default();
        let config = RuntimeConfig::parse(&text).unwrap();
        assert_eq!(config.pool.max_slots, 10_000);
    }
}
