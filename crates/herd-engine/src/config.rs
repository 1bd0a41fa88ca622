//! Batched driver configuration, validation, and error types.
//!
//! [`BatchedEnvConfig`] is the builder-input shared by
//! [`SerialEnv`](crate::serial::SerialEnv) and
//! [`ParallelEnv`](crate::parallel::ParallelEnv).
//! [`validate()`](BatchedEnvConfig::validate) checks structural
//! invariants before any instance is built.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use herd_core::{Device, EnvError};

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while configuring a batched driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `num_workers` is zero.
    NoWorkers,
    /// The factory list is neither one factory nor one per worker.
    FactoryCountMismatch {
        /// Number of workers.
        expected: usize,
        /// Number of factories supplied.
        got: usize,
    },
    /// The keyword-argument list is neither empty, one entry, nor one
    /// entry per worker.
    KwargsCountMismatch {
        /// Number of workers.
        expected: usize,
        /// Number of kwargs supplied.
        got: usize,
    },
    /// Instances come from different factories but
    /// `share_individual_td` was explicitly disabled.
    ShareIndividualTdRequired,
    /// The operation is only allowed before the driver starts.
    AlreadyStarted,
    /// The worker timeout is zero.
    InvalidTimeout,
    /// A worker channel capacity is zero.
    ZeroChannelCapacity,
    /// A worker thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of the spawn failure.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkers => write!(f, "num_workers must be at least 1"),
            Self::FactoryCountMismatch { expected, got } => write!(
                f,
                "expected 1 or {expected} env factories, got {got}"
            ),
            Self::KwargsCountMismatch { expected, got } => write!(
                f,
                "expected 0, 1 or {expected} kwargs entries, got {got}"
            ),
            Self::ShareIndividualTdRequired => write!(
                f,
                "share_individual_td must not be false for multi-task batches"
            ),
            Self::AlreadyStarted => write!(f, "the batched env has already started"),
            Self::InvalidTimeout => write!(f, "worker timeout must be non-zero"),
            Self::ZeroChannelCapacity => write!(f, "channel_capacity must be at least 1"),
            Self::ThreadSpawnFailed { reason } => {
                write!(f, "thread spawn failed: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

impl From<ConfigError> for EnvError {
    fn from(e: ConfigError) -> Self {
        EnvError::InvalidConfig {
            reason: e.to_string(),
        }
    }
}

// ── BatchedEnvConfig ───────────────────────────────────────────────

/// Configuration for a batched driver.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchedEnvConfig {
    /// Number of environment instances. Minimum: 1.
    pub num_workers: usize,
    /// Stack instance outputs with padding instead of densely.
    /// `None` = padded exactly when the batch is multi-task.
    /// `Some(false)` is rejected for multi-task batches.
    pub share_individual_td: Option<bool>,
    /// Maximum wait for a worker reply. `None` = wait indefinitely.
    /// Only [`ParallelEnv`](crate::parallel::ParallelEnv) uses it.
    pub timeout: Option<Duration>,
    /// Capacity of each worker's command and completion channels.
    /// Default: 4.
    pub channel_capacity: usize,
    /// Device every instance is moved to after construction.
    /// `None` = keep the instances' own device.
    pub device: Option<Device>,
}

impl Default for BatchedEnvConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            share_individual_td: None,
            timeout: None,
            channel_capacity: 4,
            device: None,
        }
    }
}

impl BatchedEnvConfig {
    /// Defaults for `num_workers` instances.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    /// Set [`share_individual_td`](Self::share_individual_td).
    pub fn with_share_individual_td(mut self, share: bool) -> Self {
        self.share_individual_td = Some(share);
        self
    }

    /// Set [`timeout`](Self::timeout).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set [`channel_capacity`](Self::channel_capacity).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set [`device`](Self::device).
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }

    /// Resolve whether outputs are stacked with padding.
    pub(crate) fn resolve_padding(&self, single_task: bool) -> Result<bool, ConfigError> {
        match self.share_individual_td {
            None => Ok(!single_task),
            Some(false) if !single_task => Err(ConfigError::ShareIndividualTdRequired),
            Some(share) => Ok(share),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(BatchedEnvConfig::new(3).validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        match BatchedEnvConfig::new(0).validate() {
            Err(ConfigError::NoWorkers) => {}
            other => panic!("expected NoWorkers, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_and_capacity_rejected() {
        let cfg = BatchedEnvConfig::new(2).with_timeout(Duration::ZERO);
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidTimeout));
        let cfg = BatchedEnvConfig::new(2).with_channel_capacity(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroChannelCapacity));
    }

    #[test]
    fn padding_follows_task_mix() {
        let cfg = BatchedEnvConfig::new(2);
        assert_eq!(cfg.resolve_padding(true), Ok(false));
        assert_eq!(cfg.resolve_padding(false), Ok(true));

        let dense = cfg.clone().with_share_individual_td(false);
        assert_eq!(dense.resolve_padding(true), Ok(false));
        assert_eq!(
            dense.resolve_padding(false),
            Err(ConfigError::ShareIndividualTdRequired)
        );

        let padded = cfg.with_share_individual_td(true);
        assert_eq!(padded.resolve_padding(true), Ok(true));
    }

    #[test]
    fn converts_into_invalid_config() {
        let err: EnvError = ConfigError::AlreadyStarted.into();
        match err {
            EnvError::InvalidConfig { reason } => assert!(reason.contains("already started")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }
}
