//! Process-wide bridge configuration.
//!
//! Settings size the scratch regions that stage call frames, bound the
//! async pool, and cap how large a composite type may grow. The
//! configuration can be changed freely until the first library is loaded;
//! after that it is committed and further changes are rejected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard floor for any scratch region size, in bytes.
pub const MIN_SCRATCH_SIZE: usize = 1024;
/// Hard ceiling for any scratch region size, in bytes.
pub const MAX_SCRATCH_SIZE: usize = 16 * 1024 * 1024;
/// Hard ceiling for concurrently running asynchronous calls.
pub const MAX_ASYNC_CALLS: usize = 256;
/// Hard ceiling for resident asynchronous frame pools.
pub const MAX_RESIDENT_POOLS: usize = 8;
/// Hard floor for the composite type size limit, in bytes.
pub const MIN_TYPE_SIZE: usize = 32;
/// Hard ceiling for the composite type size limit, in bytes.
pub const MAX_TYPE_SIZE: usize = 512 * 1024 * 1024;

/// Tunable limits for scratch memory, async dispatch and type sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Region for argument cells and value payloads of synchronous calls.
    pub sync_stack_size: usize,
    /// Region for output buffers and copied strings of synchronous calls.
    pub sync_heap_size: usize,
    /// Per-call argument region for asynchronous calls.
    pub async_stack_size: usize,
    /// Per-call buffer region for asynchronous calls.
    pub async_heap_size: usize,
    /// Asynchronous call frames kept allocated between calls.
    pub resident_async_pools: usize,
    /// Asynchronous calls allowed in flight at once.
    pub max_async_calls: usize,
    /// Largest size a struct, union or array type may reach, in bytes.
    pub max_type_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            sync_stack_size: 1024 * 1024,
            sync_heap_size: 2 * 1024 * 1024,
            async_stack_size: 256 * 1024,
            async_heap_size: 512 * 1024,
            resident_async_pools: 2,
            max_async_calls: 64,
            max_type_size: 64 * 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Check every setting against its hard bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scratch = [
            ("sync_stack_size", self.sync_stack_size),
            ("sync_heap_size", self.sync_heap_size),
            ("async_stack_size", self.async_stack_size),
            ("async_heap_size", self.async_heap_size),
        ];
        for (name, size) in scratch {
            if !(MIN_SCRATCH_SIZE..=MAX_SCRATCH_SIZE).contains(&size) {
                return Err(ConfigError::OutOfRange {
                    name,
                    min: MIN_SCRATCH_SIZE,
                    max: MAX_SCRATCH_SIZE,
                });
            }
        }

        if self.resident_async_pools > MAX_RESIDENT_POOLS {
            return Err(ConfigError::OutOfRange {
                name: "resident_async_pools",
                min: 0,
                max: MAX_RESIDENT_POOLS,
            });
        }
        if self.max_async_calls == 0 || self.max_async_calls > MAX_ASYNC_CALLS {
            return Err(ConfigError::OutOfRange {
                name: "max_async_calls",
                min: 1,
                max: MAX_ASYNC_CALLS,
            });
        }
        if self.max_async_calls < self.resident_async_pools {
            return Err(ConfigError::AsyncBelowResident);
        }
        if !(MIN_TYPE_SIZE..=MAX_TYPE_SIZE).contains(&self.max_type_size) {
            return Err(ConfigError::OutOfRange {
                name: "max_type_size",
                min: MIN_TYPE_SIZE,
                max: MAX_TYPE_SIZE,
            });
        }
        Ok(())
    }
}

/// Errors raised when a configuration change is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Cannot change the configuration once a library has been loaded")]
    Committed,

    #[error("Setting '{name}' must be between {min} and {max}")]
    OutOfRange {
        name: &'static str,
        min: usize,
        max: usize,
    },

    #[error("Setting 'max_async_calls' cannot be lower than 'resident_async_pools'")]
    AsyncBelowResident,
}

static CURRENT: OnceLock<RwLock<BridgeConfig>> = OnceLock::new();
static COMMITTED: AtomicBool = AtomicBool::new(false);

fn cell() -> &'static RwLock<BridgeConfig> {
    CURRENT.get_or_init(|| RwLock::new(BridgeConfig::default()))
}

/// Replace the active configuration.
///
/// Fails once any library has been loaded, or when a setting falls outside
/// its hard bounds. Rejected configurations leave the active one untouched.
pub fn configure(config: BridgeConfig) -> Result<(), ConfigError> {
    let mut guard = cell().write().unwrap();
    if COMMITTED.load(Ordering::Acquire) {
        return Err(ConfigError::Committed);
    }
    config.validate()?;
    *guard = config;
    Ok(())
}

/// Snapshot of the active configuration.
pub fn current() -> BridgeConfig {
    cell().read().unwrap().clone()
}

/// Whether the configuration has been frozen by a library load.
pub fn committed() -> bool {
    COMMITTED.load(Ordering::Acquire)
}

/// Freeze the configuration and return the values now in force.
pub(crate) fn commit() -> BridgeConfig {
    let guard = cell().read().unwrap();
    COMMITTED.store(true, Ordering::Release);
    guard.clone()
}
