//! Runtime-configurable defaults for zckpt.
//!
//! Configuration is read from environment variables on first access, and can
//! be modified at runtime through a global singleton. Command-line options
//! override these values for a single run.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default | Description |
//! |----------|------|---------|-------------|
//! | `ZCKPT_EXEC_POLICY` | `ExecutionPolicy` | `cuda` | Where the codec runs |
//! | `ZCKPT_STAGING` | `StagingMode` | `auto` | How device bytes reach storage |
//! | `ZCKPT_DEVICE` | `usize` | `0` | CUDA device ordinal |
//! | `ZCKPT_OBJECT_NAMING` | `ObjectNaming` | `fresh` | One object per pass, or overwrite |
//! | `ZCKPT_ON_FAILURE` | `FailurePolicy` | `abort` | Sweep behavior when a pass fails |
//! | `ZCKPT_TASK_SIZE` | `usize` | `4194304` (4 MiB) | Positional I/O chunk size |
//! | `ZCKPT_HOST_DEVICE_CAPACITY` | `usize` | unlimited | Capacity of the emulated device |

use std::sync::{OnceLock, RwLock};

use crate::codec::ExecutionPolicy;
use crate::error::{Error, ErrorKind};
use crate::staging::StagingMode;
use crate::storage::ObjectNaming;
use crate::sweep::FailurePolicy;

/// Default positional I/O task size: 4 MiB.
const DEFAULT_TASK_SIZE: usize = 4 * 1024 * 1024;

/// Runtime configuration for zckpt.
///
/// Thread-safe access through the global singleton via [`Config::get`] and [`Config::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Codec execution policy.
    pub exec_policy: ExecutionPolicy,
    /// Device-to-storage staging mode.
    pub staging: StagingMode,
    /// CUDA device ordinal.
    pub device_ordinal: usize,
    /// Storage object naming across passes.
    pub object_naming: ObjectNaming,
    /// What the sweep does when a pass fails.
    pub failure_policy: FailurePolicy,
    /// Chunk size for split positional I/O (bytes).
    pub task_size: usize,
    /// Capacity limit of the emulated host device (bytes), `None` for unlimited.
    pub host_device_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exec_policy: ExecutionPolicy::Cuda,
            staging: StagingMode::Auto,
            device_ordinal: 0,
            object_naming: ObjectNaming::FreshPerPass,
            failure_policy: FailurePolicy::Abort,
            task_size: DEFAULT_TASK_SIZE,
            host_device_capacity: None,
        }
    }
}

/// Global configuration singleton.
static GLOBAL_CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

impl Config {
    /// Create a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut config = Config::default();

        if let Some(val) = env_var("ZCKPT_EXEC_POLICY")? {
            config.exec_policy = ExecutionPolicy::parse(&val)?;
        }

        if let Some(val) = env_var("ZCKPT_STAGING")? {
            config.staging = StagingMode::parse(&val)?;
        }

        if let Some(val) = env_var("ZCKPT_DEVICE")? {
            config.device_ordinal = parse_usize(&val, "ZCKPT_DEVICE")?;
        }

        if let Some(val) = env_var("ZCKPT_OBJECT_NAMING")? {
            config.object_naming = ObjectNaming::parse(&val)?;
        }

        if let Some(val) = env_var("ZCKPT_ON_FAILURE")? {
            config.failure_policy = FailurePolicy::parse(&val)?;
        }

        if let Some(val) = env_var("ZCKPT_TASK_SIZE")? {
            let task_size = parse_usize(&val, "ZCKPT_TASK_SIZE")?;
            if task_size == 0 {
                return Err(Error::new(
                    ErrorKind::ConfigInvalid,
                    "ZCKPT_TASK_SIZE must be greater than zero",
                )
                .with_operation("Config::from_env"));
            }
            config.task_size = task_size;
        }

        if let Some(val) = env_var("ZCKPT_HOST_DEVICE_CAPACITY")? {
            config.host_device_capacity =
                Some(parse_usize(&val, "ZCKPT_HOST_DEVICE_CAPACITY")?);
        }

        Ok(config)
    }

    /// Get a read-only snapshot of the global configuration.
    ///
    /// On first call, reads from environment variables. Subsequent calls return
    /// the (possibly modified) global configuration.
    pub fn get() -> Config {
        match global().read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the global configuration.
    pub fn set(config: Config) {
        Config::update(|c| *c = config);
    }

    /// Modify the global configuration in place via a closure.
    pub fn update(f: impl FnOnce(&mut Config)) {
        let mut guard = match global().write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

fn global() -> &'static RwLock<Config> {
    GLOBAL_CONFIG.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring invalid environment configuration");
            Config::default()
        });
        RwLock::new(config)
    })
}

/// Read an environment variable, returning `None` if it is unset or empty.
fn env_var(name: &str) -> crate::error::Result<Option<String>> {
    match std::env::var(name) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("environment variable {name} contains invalid Unicode"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", name)),
    }
}

fn parse_usize(val: &str, var_name: &str) -> crate::error::Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::new(
            ErrorKind::ConfigInvalid,
            format!("invalid value for {var_name}: {val:?}"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", var_name)
        .set_source(e)
    })
}
