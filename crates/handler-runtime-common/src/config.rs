//! Configuration structures for handler-runtime.
//!
//! This module defines configuration options for the engine components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Guest VM settings (memory, stack, debug)
//! - [`ExecutionConfig`]: Per-request limits (timeout, host-call ceiling)
//! - [`PoolConfig`]: Instance pool bounds
//! - [`CacheConfig`]: Two-tier bytecode cache bounds

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for handler-runtime.
/// It can be loaded from files (TOML, JSON) or built programmatically.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Guest VM configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-request execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Bytecode cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Guest VM configuration.
///
/// These settings apply to every QuickJS runtime the pool creates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Memory limit per instance in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Maximum guest stack size in kilobytes.
    #[serde(default = "defaults::max_stack_kb")]
    pub max_stack_kb: u32,

    /// Expose guest stack traces in error results.
    ///
    /// Off by default so guest internals do not leak to production hosts.
    #[serde(default)]
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_memory_mb: defaults::instance_memory_mb(),
            max_stack_kb: defaults::max_stack_kb(),
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Memory limit in bytes.
    pub fn memory_limit_bytes(&self) -> usize {
        (self.instance_memory_mb as usize) * 1024 * 1024
    }

    /// Stack limit in bytes.
    pub fn stack_limit_bytes(&self) -> usize {
        (self.max_stack_kb as usize) * 1024
    }
}

/// Per-request execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Execution timeout in milliseconds.
    ///
    /// Applies to each VM segment: the initial run and every resume.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum host function calls per execution.
    ///
    /// Bounds pathological handlers that loop over host calls. Logging
    /// counts toward the ceiling like every other host call.
    #[serde(default = "defaults::max_host_calls")]
    pub max_host_calls: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            max_host_calls: defaults::max_host_calls(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Instances created eagerly at pool construction.
    #[serde(default = "defaults::min_instances")]
    pub min_instances: usize,

    /// Maximum concurrent instances (Active + Suspended).
    ///
    /// This is the admission-control bound: excess executions queue on
    /// `acquire` rather than spawning unbounded instances.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: usize,

    /// Maximum idle instances retained for reuse; overflow is terminated.
    #[serde(default = "defaults::max_idle")]
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: defaults::min_instances(),
            max_instances: defaults::max_instances(),
            max_idle: defaults::max_idle(),
        }
    }
}

/// Bytecode cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum entries in the in-memory tier.
    #[serde(default = "defaults::memory_max_entries")]
    pub memory_max_entries: usize,

    /// Maximum total bytes in the in-memory tier.
    #[serde(default = "defaults::memory_max_bytes")]
    pub memory_max_bytes: u64,

    /// Directory for the disk tier. Disk caching is disabled when unset.
    #[serde(default)]
    pub disk_dir: Option<String>,

    /// Maximum total bytes across disk tier files; least-recently-used
    /// files are evicted once exceeded.
    #[serde(default = "defaults::disk_max_bytes")]
    pub disk_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: defaults::memory_max_entries(),
            memory_max_bytes: defaults::memory_max_bytes(),
            disk_dir: None,
            disk_max_bytes: defaults::disk_max_bytes(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn max_stack_kb() -> u32 {
        512
    }

    pub const fn timeout_ms() -> u64 {
        5_000
    }

    pub const fn max_host_calls() -> u32 {
        10_000
    }

    pub const fn min_instances() -> usize {
        1
    }

    pub const fn max_instances() -> usize {
        32
    }

    pub const fn max_idle() -> usize {
        8
    }

    pub const fn memory_max_entries() -> usize {
        256
    }

    pub const fn memory_max_bytes() -> u64 {
        32 * 1024 * 1024
    }

    pub const fn disk_max_bytes() -> u64 {
        256 * 1024 * 1024
    }
}
