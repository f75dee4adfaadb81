/// Redis client wrapper for the shared coordination store
///
/// This module provides the connection layer every process shares:
/// - Connection pooling via redis::aio::ConnectionManager
/// - Automatic reconnection on failure
/// - Health checks (PING command)
/// - Configuration from environment variables
///
/// The store contract the coordination layer relies on is small: string
/// SET/GET/DEL plus hash HSET/HDEL/HGET/HGETALL/HKEYS/HLEN, all over UTF-8
/// strings.
///
/// # Example
///
/// ```no_run
/// use refmesh_core::store::client::{RedisClient, RedisConfig};
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = RedisClient::new(RedisConfig::from_env()).await?;
/// let healthy = client.ping().await?;
/// println!("store healthy: {}", healthy);
/// # Ok(())
/// # }
/// ```

use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Redis client errors
#[derive(Error, Debug)]
pub enum RedisClientError {
    /// Connection error
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    /// Command execution error
    #[error("Redis command error: {0}")]
    CommandError(String),

    /// Configuration error
    #[error("Redis configuration error: {0}")]
    ConfigError(String),

    /// Health check failed
    #[error("Redis health check failed: {0}")]
    HealthCheckFailed(String),
}

impl From<RedisError> for RedisClientError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::IoError => {
                RedisClientError::ConnectionError(format!("IO error: {}", err))
            }
            redis::ErrorKind::ResponseError => {
                RedisClientError::CommandError(format!("Response error: {}", err))
            }
            _ => RedisClientError::CommandError(err.to_string()),
        }
    }
}

/// Shared store address
///
/// The first process constructed in an address space wins: later processes
/// reuse its connection and their own parameters are ignored with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Host to connect to
    pub host: String,

    /// Port to connect on
    pub port: u16,

    /// Database index
    pub db: u32,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 1,
            command_timeout_secs: 10,
        }
    }
}

impl RedisConfig {
    /// Loads the store address from environment variables
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_HOST`: Host (default: localhost)
    /// - `REDIS_PORT`: Port (default: 6379)
    /// - `REDIS_DB`: Database index (default: 1)
    /// - `REDIS_COMMAND_TIMEOUT_SECS`: Command timeout (default: 10)
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Self {
            host: env::var("REDIS_HOST").unwrap_or(defaults.host),
            port: env::var("REDIS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            db: env::var("REDIS_DB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.db),
            command_timeout_secs: env::var("REDIS_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.command_timeout_secs),
        }
    }

    /// Connection URL for the redis driver.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    /// True when two configs point at the same store.
    pub fn same_address(&self, other: &RedisConfig) -> bool {
        self.host == other.host && self.port == other.port && self.db == other.db
    }

    /// Creates a default configuration for testing
    pub fn default_for_test() -> Self {
        Self::default()
    }
}

/// Shared store client with connection management
///
/// Wraps the redis crate's ConnectionManager to provide automatic
/// reconnection, health checking, and thread-safe cloning.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
    config: Arc<RedisConfig>,
}

impl RedisClient {
    /// Creates a new client with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the initial connection
    /// fails.
    pub async fn new(config: RedisConfig) -> Result<Self, RedisClientError> {
        let client = Client::open(config.url()).map_err(|e| {
            RedisClientError::ConfigError(format!("Invalid Redis URL: {}", e))
        })?;

        // The connection manager handles reconnection automatically
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            RedisClientError::ConnectionError(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connected to shared store"
        );

        Ok(Self {
            manager,
            config: Arc::new(config),
        })
    }

    /// Performs a health check by sending a PING command
    ///
    /// # Returns
    ///
    /// Returns `true` if Redis responds with PONG, `false` otherwise.
    pub async fn ping(&self) -> Result<bool, RedisClientError> {
        let mut conn = self.manager.clone();

        let result: Result<String, RedisError> = tokio::time::timeout(
            Duration::from_secs(self.config.command_timeout_secs),
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| RedisClientError::HealthCheckFailed("PING command timed out".to_string()))?;

        match result {
            Ok(pong) if pong == "PONG" => Ok(true),
            Ok(other) => {
                tracing::warn!("Health check: unexpected response: {}", other);
                Ok(false)
            }
            Err(e) => {
                tracing::error!("Health check failed: {}", e);
                Err(RedisClientError::HealthCheckFailed(e.to_string()))
            }
        }
    }

    /// Gets a connection handle
    ///
    /// The connection manager reconnects on loss, so the handle is always
    /// usable.
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Gets the store address this client was built with
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}
