//! Runtime configuration.
//!
//! [`RuntimeOptions`] holds the concrete values that drive runtime behavior.
//! Values are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — fields set on the struct before launch
//! 2. **Environment variables** — values from `WEFT_*` env vars, applied by
//!    [`RuntimeOptions::from_env`] / [`apply_env_overrides`]
//! 3. **Defaults** — built-in defaults from [`RuntimeOptions::default()`]
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `stack_size` | 2 MiB (frame slots = size / frame bytes) |
//! | `thread_state_capacity` | 65 536 entries |
//! | `suspended_capacity` | 65 536 entries |
//! | `adws_max_depth` | 25 |
//! | `adws_wsqueue_capacity` | 1024 entries per depth |
//! | `adws_min_drange_size` | 0.01 |
//! | `adws_max_dtree_reuse` | 10 |
//! | `adws_enable_steal` | true |
//! | `sched_loop_make_progress` | true |
//! | `block_size` | 64 KiB |
//! | `home_mmap_entry_limit` | 1024 |
//! | `seed` | 42 |

use crate::error::{Error, Result};

/// Environment variable name for the call-stack region size in bytes.
pub const ENV_STACK_SIZE: &str = "WEFT_STACK_SIZE";
/// Environment variable name for the thread-state arena capacity (entries).
pub const ENV_THREAD_STATE_CAPACITY: &str = "WEFT_THREAD_STATE_CAPACITY";
/// Environment variable name for the evacuated-payload arena capacity
/// (entries).
pub const ENV_SUSPENDED_CAPACITY: &str = "WEFT_SUSPENDED_CAPACITY";
/// Environment variable name for the distribution-tree depth limit.
pub const ENV_ADWS_MAX_DEPTH: &str = "WEFT_ADWS_MAX_DEPTH";
/// Environment variable name for the per-depth work-stealing queue capacity.
pub const ENV_ADWS_WSQUEUE_CAPACITY: &str = "WEFT_ADWS_WSQUEUE_CAPACITY";
/// Environment variable name for the minimum distribution-range width.
pub const ENV_ADWS_MIN_DRANGE_SIZE: &str = "WEFT_ADWS_MIN_DRANGE_SIZE";
/// Environment variable name for steal attempts per distribution-tree scan.
pub const ENV_ADWS_MAX_DTREE_REUSE: &str = "WEFT_ADWS_MAX_DTREE_REUSE";
/// Environment variable name for the work-stealing master switch.
pub const ENV_ADWS_ENABLE_STEAL: &str = "WEFT_ADWS_ENABLE_STEAL";
/// Environment variable name for pumping transport progress in the loop.
pub const ENV_SCHED_LOOP_MAKE_PROGRESS: &str = "WEFT_SCHED_LOOP_MAKE_PROGRESS";
/// Environment variable name for the global-memory block size.
pub const ENV_BLOCK_SIZE: &str = "WEFT_BLOCK_SIZE";
/// Environment variable name for the home-mapping entry limit.
pub const ENV_HOME_MMAP_ENTRY_LIMIT: &str = "WEFT_HOME_MMAP_ENTRY_LIMIT";
/// Environment variable name for the deterministic RNG seed.
pub const ENV_SEED: &str = "WEFT_SEED";

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Size of the per-rank call-stack region in bytes.
    pub stack_size: usize,
    /// Capacity of the per-rank thread-state arena, in entries.
    pub thread_state_capacity: usize,
    /// Capacity of the per-rank evacuated-payload arena, in entries.
    pub suspended_capacity: usize,
    /// Distribution-tree depth limit.
    pub adws_max_depth: usize,
    /// Entries per depth per work-stealing queue.
    pub adws_wsqueue_capacity: usize,
    /// Distribution ranges narrower than this snap to a worker boundary.
    pub adws_min_drange_size: f64,
    /// How many steal attempts share a single distribution-tree scan.
    pub adws_max_dtree_reuse: usize,
    /// Master switch for work stealing.
    pub adws_enable_steal: bool,
    /// Whether the scheduler loop pumps transport progress each iteration.
    pub sched_loop_make_progress: bool,
    /// Global-memory block size in bytes.
    pub block_size: usize,
    /// Maximum number of live home-mapping entries per rank.
    pub home_mmap_entry_limit: usize,
    /// Seed for the per-worker deterministic RNGs.
    pub seed: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            stack_size: 2 * 1024 * 1024,
            thread_state_capacity: 65_536,
            suspended_capacity: 65_536,
            adws_max_depth: 25,
            adws_wsqueue_capacity: 1024,
            adws_min_drange_size: 0.01,
            adws_max_dtree_reuse: 10,
            adws_enable_steal: true,
            sched_loop_make_progress: true,
            block_size: 64 * 1024,
            home_mmap_entry_limit: 1024,
            seed: 42,
        }
    }
}

impl RuntimeOptions {
    /// Builds options from defaults plus any `WEFT_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut opts = Self::default();
        apply_env_overrides(&mut opts)?;
        Ok(opts)
    }

    /// Normalize configuration values to safe bounds.
    ///
    /// The flipper version mask has 64 bits, so the depth limit is clamped to
    /// 63; the stack must hold at least a handful of frames.
    pub fn normalize(&mut self) {
        if self.adws_max_depth == 0 {
            self.adws_max_depth = 1;
        }
        if self.adws_max_depth > 63 {
            self.adws_max_depth = 63;
        }
        if self.adws_wsqueue_capacity == 0 {
            self.adws_wsqueue_capacity = 8;
        }
        if self.stack_size < 4096 {
            self.stack_size = 4096;
        }
        if self.block_size == 0 {
            self.block_size = 64 * 1024;
        }
        if self.adws_min_drange_size <= 0.0 {
            self.adws_min_drange_size = 0.01;
        }
    }
}

/// Apply environment variable overrides to a [`RuntimeOptions`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(opts: &mut RuntimeOptions) -> Result<()> {
    if let Some(val) = read_env(ENV_STACK_SIZE) {
        opts.stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_STATE_CAPACITY) {
        opts.thread_state_capacity = parse_usize(ENV_THREAD_STATE_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_SUSPENDED_CAPACITY) {
        opts.suspended_capacity = parse_usize(ENV_SUSPENDED_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_ADWS_MAX_DEPTH) {
        opts.adws_max_depth = parse_usize(ENV_ADWS_MAX_DEPTH, &val)?;
    }
    if let Some(val) = read_env(ENV_ADWS_WSQUEUE_CAPACITY) {
        opts.adws_wsqueue_capacity = parse_usize(ENV_ADWS_WSQUEUE_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_ADWS_MIN_DRANGE_SIZE) {
        opts.adws_min_drange_size = parse_f64(ENV_ADWS_MIN_DRANGE_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_ADWS_MAX_DTREE_REUSE) {
        opts.adws_max_dtree_reuse = parse_usize(ENV_ADWS_MAX_DTREE_REUSE, &val)?;
    }
    if let Some(val) = read_env(ENV_ADWS_ENABLE_STEAL) {
        opts.adws_enable_steal = parse_bool(ENV_ADWS_ENABLE_STEAL, &val)?;
    }
    if let Some(val) = read_env(ENV_SCHED_LOOP_MAKE_PROGRESS) {
        opts.sched_loop_make_progress = parse_bool(ENV_SCHED_LOOP_MAKE_PROGRESS, &val)?;
    }
    if let Some(val) = read_env(ENV_BLOCK_SIZE) {
        opts.block_size = parse_usize(ENV_BLOCK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_HOME_MMAP_ENTRY_LIMIT) {
        opts.home_mmap_entry_limit = parse_usize(ENV_HOME_MMAP_ENTRY_LIMIT, &val)?;
    }
    if let Some(val) = read_env(ENV_SEED) {
        opts.seed = parse_u64(ENV_SEED, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})"
        ))
    })
}

fn parse_u64(var_name: &str, val: &str) -> Result<u64> {
    val.trim().parse::<u64>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected u64, got {val:?} ({e})"
        ))
    })
}

fn parse_f64(var_name: &str, val: &str) -> Result<f64> {
    val.trim().parse::<f64>().map_err(|e| {
        Error::config(format!(
            "invalid value for {var_name}: expected float, got {val:?} ({e})"
        ))
    })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid value for {var_name}: expected bool (true/false/1/0/yes/no), got {val:?}"
        ))),
    }
}
