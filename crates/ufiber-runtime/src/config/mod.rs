//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. User's ufiber_config.rs (compile-time, via `UFIBER_CONFIG_RS`)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use ufiber_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .num_processors(4)
//!     .ring_entries(1024)
//!     .hook_enabled(true);
//! ```

pub mod defaults;

use std::time::Duration;
use thiserror::Error;
use ufiber_core::constants::{MAX_RING_ENTRIES, MIN_STACK_SIZE};
use ufiber_core::env::{env_get, env_get_bool, env_get_ms};

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of processors (OS threads); 0 = one per available CPU
    pub num_processors: usize,
    /// Submission queue depth of each processor's io_uring
    pub ring_entries: u32,
    /// Initial value of the per-thread hook flag on processor threads
    pub hook_enabled: bool,
    /// Stack size per fiber
    pub stack_size: usize,
    /// Local queue length above which spawn goes to the global queue
    pub local_queue_capacity: usize,
    /// Terminated fibers cached per processor
    pub free_list_capacity: usize,
    /// Upper bound of a single reactor wait
    pub max_event_wait: Duration,
    /// Idle processor park timeout
    pub park_timeout: Duration,
    /// Yielding lock attempts before a mutex waits on the futex
    pub mutex_spin_count: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `UFIBER_NUM_PROCESSORS` - Number of processors (0 = CPU count)
    /// - `UFIBER_RING_ENTRIES` - io_uring submission queue depth
    /// - `UFIBER_HOOK_ENABLED` - Hook blocking calls on processor threads
    /// - `UFIBER_STACK_SIZE` - Stack size per fiber
    /// - `UFIBER_LOCAL_QUEUE_CAPACITY` - Per-processor queue size
    /// - `UFIBER_FREE_LIST_CAPACITY` - Cached fibers per processor
    /// - `UFIBER_MAX_EVENT_WAIT_MS` - Max reactor wait in milliseconds
    /// - `UFIBER_PARK_TIMEOUT_MS` - Park timeout in milliseconds
    /// - `UFIBER_MUTEX_SPIN_COUNT` - Mutex spins before waiting
    pub fn from_env() -> Self {
        Self {
            num_processors: env_get("UFIBER_NUM_PROCESSORS", defaults::NUM_PROCESSORS),
            ring_entries: env_get("UFIBER_RING_ENTRIES", defaults::RING_ENTRIES),
            hook_enabled: env_get_bool("UFIBER_HOOK_ENABLED", defaults::HOOK_ENABLED),
            stack_size: env_get("UFIBER_STACK_SIZE", defaults::STACK_SIZE),
            local_queue_capacity: env_get(
                "UFIBER_LOCAL_QUEUE_CAPACITY",
                defaults::LOCAL_QUEUE_CAPACITY,
            ),
            free_list_capacity: env_get(
                "UFIBER_FREE_LIST_CAPACITY",
                defaults::FREE_LIST_CAPACITY,
            ),
            max_event_wait: env_get_ms(
                "UFIBER_MAX_EVENT_WAIT_MS",
                Duration::from_millis(defaults::MAX_EVENT_WAIT_MS),
            ),
            park_timeout: env_get_ms(
                "UFIBER_PARK_TIMEOUT_MS",
                Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            ),
            mutex_spin_count: env_get("UFIBER_MUTEX_SPIN_COUNT", defaults::MUTEX_SPIN_COUNT),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_processors: defaults::NUM_PROCESSORS,
            ring_entries: defaults::RING_ENTRIES,
            hook_enabled: defaults::HOOK_ENABLED,
            stack_size: defaults::STACK_SIZE,
            local_queue_capacity: defaults::LOCAL_QUEUE_CAPACITY,
            free_list_capacity: defaults::FREE_LIST_CAPACITY,
            max_event_wait: Duration::from_millis(defaults::MAX_EVENT_WAIT_MS),
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            mutex_spin_count: defaults::MUTEX_SPIN_COUNT,
        }
    }

    // Builder methods

    pub fn num_processors(mut self, n: usize) -> Self {
        self.num_processors = n;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    pub fn hook_enabled(mut self, enable: bool) -> Self {
        self.hook_enabled = enable;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn local_queue_capacity(mut self, cap: usize) -> Self {
        self.local_queue_capacity = cap;
        self
    }

    pub fn free_list_capacity(mut self, cap: usize) -> Self {
        self.free_list_capacity = cap;
        self
    }

    pub fn max_event_wait(mut self, d: Duration) -> Self {
        self.max_event_wait = d;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn mutex_spin_count(mut self, spins: u32) -> Self {
        self.mutex_spin_count = spins;
        self
    }

    /// Processor count with 0 resolved to the available parallelism
    pub fn effective_processors(&self) -> usize {
        if self.num_processors > 0 {
            return self.num_processors;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_entries == 0 {
            return Err(ConfigError::InvalidValue("ring_entries must be > 0"));
        }
        if !self.ring_entries.is_power_of_two() {
            return Err(ConfigError::InvalidValue("ring_entries must be a power of two"));
        }
        if self.ring_entries > MAX_RING_ENTRIES {
            return Err(ConfigError::InvalidValue("ring_entries must be <= 32768"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 64KB"));
        }
        if self.local_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("local_queue_capacity must be > 0"));
        }
        if self.max_event_wait.is_zero() {
            return Err(ConfigError::InvalidValue("max_event_wait must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("ufiber Configuration:");
        eprintln!("  num_processors:         {}", self.num_processors);
        eprintln!("  ring_entries:           {}", self.ring_entries);
        eprintln!("  hook_enabled:           {}", self.hook_enabled);
        eprintln!("  stack_size:             {}", self.stack_size);
        eprintln!("  local_queue_capacity:   {}", self.local_queue_capacity);
        eprintln!("  free_list_capacity:     {}", self.free_list_capacity);
        eprintln!("  max_event_wait:         {:?}", self.max_event_wait);
        eprintln!("  park_timeout:           {:?}", self.park_timeout);
        eprintln!("  mutex_spin_count:       {}", self.mutex_spin_count);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    InvalidValue(&'static str),
}
