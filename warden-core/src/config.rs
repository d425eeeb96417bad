//! Configuration types

use crate::{ConfigError, WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lease length when a caller does not ask for one.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;
/// Default upper bound on how long a waiting acquire keeps retrying.
pub const DEFAULT_LOCK_MAX_WAIT_MS: u64 = 30_000;
/// Default pause between retries of a waiting acquire.
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 100;
/// Default period of the expired-lease sweeper.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Coordination engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CoordinationConfig {
    /// Lease length applied when an acquire does not specify one
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub default_lock_ttl: Duration,
    /// Wait budget for acquires in waiting mode
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub max_lock_wait: Duration,
    /// Pause between retries while waiting
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub lock_retry_interval: Duration,
    /// Period of the optional expired-lease sweeper
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub sweep_interval: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            max_lock_wait: Duration::from_millis(DEFAULT_LOCK_MAX_WAIT_MS),
            lock_retry_interval: Duration::from_millis(DEFAULT_LOCK_RETRY_INTERVAL_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl CoordinationConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `WARDEN_LOCK_TTL_SECS`: Default lease length (default: 60)
    /// - `WARDEN_LOCK_MAX_WAIT_MS`: Wait budget for waiting acquires (default: 30000)
    /// - `WARDEN_LOCK_RETRY_INTERVAL_MS`: Pause between retries (default: 100)
    /// - `WARDEN_SWEEP_INTERVAL_SECS`: Sweeper period (default: 60)
    pub fn from_env() -> Self {
        Self {
            default_lock_ttl: Duration::from_secs(
                env_u64("WARDEN_LOCK_TTL_SECS").unwrap_or(DEFAULT_LOCK_TTL_SECS),
            ),
            max_lock_wait: Duration::from_millis(
                env_u64("WARDEN_LOCK_MAX_WAIT_MS").unwrap_or(DEFAULT_LOCK_MAX_WAIT_MS),
            ),
            lock_retry_interval: Duration::from_millis(
                env_u64("WARDEN_LOCK_RETRY_INTERVAL_MS").unwrap_or(DEFAULT_LOCK_RETRY_INTERVAL_MS),
            ),
            sweep_interval: Duration::from_secs(
                env_u64("WARDEN_SWEEP_INTERVAL_SECS").unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
        }
    }

    /// Set the default lease length.
    pub fn with_default_lock_ttl(mut self, ttl: Duration) -> Self {
        self.default_lock_ttl = ttl;
        self
    }

    /// Set the wait budget and retry pause for waiting acquires.
    pub fn with_wait(mut self, max_lock_wait: Duration, lock_retry_interval: Duration) -> Self {
        self.max_lock_wait = max_lock_wait;
        self.lock_retry_interval = lock_retry_interval;
        self
    }

    /// Set the sweeper period.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every duration is positive
    /// - lock_retry_interval <= max_lock_wait
    pub fn validate(&self) -> WardenResult<()> {
        for (field, value) in [
            ("default_lock_ttl", self.default_lock_ttl),
            ("max_lock_wait", self.max_lock_wait),
            ("lock_retry_interval", self.lock_retry_interval),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(WardenError::Config(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: format!("{} must be positive", field),
                }));
            }
        }

        if self.lock_retry_interval > self.max_lock_wait {
            return Err(WardenError::Config(ConfigError::InvalidValue {
                field: "lock_retry_interval".to_string(),
                value: format!("{:?}", self.lock_retry_interval),
                reason: "lock_retry_interval must not exceed max_lock_wait".to_string(),
            }));
        }

        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

// =============================================================================
// TESTS
// =============================================================================
