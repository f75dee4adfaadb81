/// Configuration for the coordination layer
///
/// This module loads configuration from environment variables and provides
/// a type-safe configuration struct with liveness validation.
///
/// # Environment Variables
///
/// - `REDIS_HOST`: Shared store host (default: localhost)
/// - `REDIS_PORT`: Shared store port (default: 6379)
/// - `REDIS_DB`: Shared store database index (default: 1)
/// - `REFMESH_TTL_SECS`: Reflist/lock expiry in seconds (default: 1800)
/// - `REFMESH_RETRY_SLEEP_MS`: Lock-acquire poll interval (default: 500)
/// - `REFMESH_LOCK_TIMEOUT_SECS`: Lock-acquire max wait (default: 500)
/// - `REFMESH_SESSION_LENGTH_SECS`: Session horizon (default: TTL/2)
/// - `REFMESH_HEARTBEAT_INTERVAL_SECS`: Heartbeat emit period (default: 10)
///
/// # Example
///
/// ```no_run
/// use refmesh_core::config::CoordinatorConfig;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = CoordinatorConfig::from_env()?;
/// println!("Heartbeat every {:?}", config.heartbeat_interval());
/// # Ok(())
/// # }
/// ```

use crate::store::client::RedisConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Namespace prefix for every key the coordination layer writes.
pub const NAMESPACE: &str = "refmesh";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value could not be parsed from its environment variable
    #[error("Invalid value for {var}: {error}")]
    InvalidValue { var: String, error: String },

    /// The session horizon outlives half the TTL
    #[error(
        "session_length ({session_length}s) must be at most half of TTL ({ttl}s)"
    )]
    SessionTooLong { session_length: u64, ttl: u64 },

    /// Orphan recovery would fire after the dead holder's lock expired
    #[error(
        "5 * heartbeat_interval ({threshold}s) must be strictly less than TTL ({ttl}s)"
    )]
    HeartbeatTooSlow { threshold: u64, ttl: u64 },
}

/// Coordination layer configuration
///
/// Defaults match the canonical deployment: a 30 minute TTL, half-TTL
/// sessions, and a 10 second heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Shared store address
    pub redis: RedisConfig,

    /// Reflist/lock expiry for dead holders, in seconds
    pub ttl_secs: u64,

    /// Lock-acquire poll interval, in milliseconds
    pub retry_sleep_ms: u64,

    /// Lock-acquire max wait, in seconds
    pub lock_timeout_secs: u64,

    /// Per-resource session horizon, in seconds; at most TTL/2
    pub session_length_secs: u64,

    /// Heartbeat emit period, in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let ttl_secs = 1800;
        Self {
            redis: RedisConfig::default(),
            ttl_secs,
            retry_sleep_ms: 500,
            lock_timeout_secs: 500,
            session_length_secs: ttl_secs / 2,
            heartbeat_interval_secs: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Loads configuration from environment variables
    ///
    /// Unset variables fall back to defaults; `session_length` falls back to
    /// half the (possibly overridden) TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but unparseable, or if the
    /// resulting configuration violates the liveness inequalities (see
    /// [`CoordinatorConfig::validate`]).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let ttl_secs = parse_var("REFMESH_TTL_SECS", 1800)?;
        let config = Self {
            redis: RedisConfig::from_env(),
            ttl_secs,
            retry_sleep_ms: parse_var("REFMESH_RETRY_SLEEP_MS", 500)?,
            lock_timeout_secs: parse_var("REFMESH_LOCK_TIMEOUT_SECS", 500)?,
            session_length_secs: parse_var("REFMESH_SESSION_LENGTH_SECS", ttl_secs / 2)?,
            heartbeat_interval_secs: parse_var("REFMESH_HEARTBEAT_INTERVAL_SECS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the liveness inequalities
    ///
    /// - `session_length <= TTL/2`: a live process renews its reflist rows
    ///   before they can expire.
    /// - `5 * heartbeat_interval < TTL`: orphan recovery fires before the
    ///   dead process's lock auto-expires into a third party's hands.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_length_secs * 2 > self.ttl_secs {
            return Err(ConfigError::SessionTooLong {
                session_length: self.session_length_secs,
                ttl: self.ttl_secs,
            });
        }

        let threshold = 5 * self.heartbeat_interval_secs;
        if threshold >= self.ttl_secs {
            return Err(ConfigError::HeartbeatTooSlow {
                threshold,
                ttl: self.ttl_secs,
            });
        }

        Ok(())
    }

    /// Reflist/lock expiry as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Lock-acquire poll interval as a Duration.
    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    /// Lock-acquire max wait as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Session horizon as a Duration.
    pub fn session_length(&self) -> Duration {
        Duration::from_secs(self.session_length_secs)
    }

    /// Heartbeat emit period as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// A process is declared failed once its heartbeat is older than this.
    pub fn failure_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds((5 * self.heartbeat_interval_secs) as i64)
    }
}

fn parse_var(var: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: std::num::ParseIntError| {
            ConfigError::InvalidValue {
                var: var.to_string(),
                error: e.to_string(),
            }
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.ttl_secs, 1800);
        assert_eq!(config.retry_sleep_ms, 500);
        assert_eq!(config.lock_timeout_secs, 500);
        assert_eq!(config.session_length_secs, 900);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_length_must_fit_ttl() {
        let config = CoordinatorConfig {
            session_length_secs: 1000,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SessionTooLong { .. })
        ));
    }

    #[test]
    fn test_recovery_must_precede_lock_expiry() {
        let config = CoordinatorConfig {
            heartbeat_interval_secs: 360,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn test_durations() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.retry_sleep(), Duration::from_millis(500));
        assert_eq!(config.ttl(), Duration::from_secs(1800));
        assert_eq!(config.failure_threshold(), chrono::Duration::seconds(50));
    }
}
