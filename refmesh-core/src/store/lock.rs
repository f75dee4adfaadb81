/// Distributed named lock over the shared store
///
/// Locks are acquired with the Redis `SET key value NX PX millis` pattern:
/// the key is only set when absent, it expires after the configured TTL so a
/// dead holder's lock self-releases, and a UUID owner token stored as the
/// value ensures only the holder can release it. Release is a Lua script so
/// the compare-owner-and-delete is atomic; a lock that expired and was
/// re-acquired by another process is never deleted by the stale holder.
///
/// The lock is non-reentrant: a second acquire while holding fails.
///
/// # Example
///
/// ```no_run
/// use refmesh_core::store::client::{RedisClient, RedisConfig};
/// use refmesh_core::store::lock::{LockSettings, NamedLock};
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = RedisClient::new(RedisConfig::from_env()).await?;
/// let mut lock = NamedLock::new(client, "user.123", LockSettings::default());
///
/// if lock.acquire(true).await? {
///     // critical section
///     lock.release().await?;
/// }
/// # Ok(())
/// # }
/// ```

use crate::keys;
use crate::store::client::RedisClient;
use redis::Script;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Atomic compare-owner-and-delete.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Non-blocking acquisition failed: the lock is held (by another
    /// process, or already by this instance)
    #[error("Lock is already held: {0}")]
    AlreadyLocked(String),

    /// Blocking acquisition exceeded the configured timeout
    #[error("Timed out acquiring lock {name} after {waited_secs}s")]
    Timeout { name: String, waited_secs: u64 },

    /// Shared store unreachable or command failed
    #[error("Redis command error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Lock backend settings
///
/// Configured once per address space by the first process constructed; see
/// the process module.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// How long a held lock survives without release
    pub expire: Duration,

    /// Poll interval while blocking on a contended lock
    pub retry_interval: Duration,

    /// Max wait for a blocking acquisition
    pub timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(1800),
            retry_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(500),
        }
    }
}

/// A distributed mutex bound to a resource name
///
/// TTL-expiring; at most one process holds the lock for a given name at any
/// instant (single-store deployments).
pub struct NamedLock {
    client: RedisClient,
    name: String,
    key: String,
    settings: LockSettings,
    /// Owner token while held
    owner: Option<String>,
}

impl NamedLock {
    /// Creates a lock handle for `name`. Nothing is acquired yet.
    pub fn new(client: RedisClient, name: &str, settings: LockSettings) -> Self {
        Self {
            client,
            name: name.to_string(),
            key: keys::lock_key(name),
            settings,
            owner: None,
        }
    }

    /// The resource name this lock guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while this instance holds the lock.
    pub fn is_held(&self) -> bool {
        self.owner.is_some()
    }

    /// Acquires the lock
    ///
    /// With `blocking == true`, polls every `retry_interval` until the lock
    /// is free or `timeout` elapses. With `blocking == false`, a single
    /// attempt is made.
    ///
    /// # Errors
    ///
    /// - [`LockError::AlreadyLocked`] when non-blocking and the lock is held,
    ///   or when this instance already holds it (non-reentrant).
    /// - [`LockError::Timeout`] when a blocking acquire exceeds the timeout.
    pub async fn acquire(&mut self, blocking: bool) -> Result<bool, LockError> {
        if self.owner.is_some() {
            return Err(LockError::AlreadyLocked(self.name.clone()));
        }

        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.settings.timeout;

        loop {
            if self.try_set(&token).await? {
                tracing::debug!(lock = %self.name, "Acquired lock");
                self.owner = Some(token);
                return Ok(true);
            }

            if !blocking {
                return Err(LockError::AlreadyLocked(self.name.clone()));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: self.name.clone(),
                    waited_secs: self.settings.timeout.as_secs(),
                });
            }

            let sleep = self.settings.retry_interval.min(deadline - now);
            tokio::time::sleep(sleep).await;
        }
    }

    /// Releases the lock if held; idempotent
    ///
    /// A lock that already expired (and was possibly taken over) is left
    /// alone and a warning is logged.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let token = match self.owner.take() {
            Some(token) => token,
            None => return Ok(()),
        };

        let mut conn = self.client.get_connection();
        let script = Script::new(RELEASE_SCRIPT);
        let released: i64 = script
            .key(&self.key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            tracing::warn!(
                lock = %self.name,
                "Lock expired before release; not deleting"
            );
        } else {
            tracing::debug!(lock = %self.name, "Released lock");
        }

        Ok(())
    }

    /// One SET NX PX attempt.
    async fn try_set(&self, token: &str) -> Result<bool, LockError> {
        let mut conn = self.client.get_connection();
        let expire_ms = self.settings.expire.as_millis() as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(expire_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::client::RedisConfig;

    #[test]
    fn test_settings_default() {
        let settings = LockSettings::default();
        assert_eq!(settings.expire, Duration::from_secs(1800));
        assert_eq!(settings.retry_interval, Duration::from_millis(500));
        assert_eq!(settings.timeout, Duration::from_secs(500));
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_acquire_is_non_reentrant() {
        let client = RedisClient::new(RedisConfig::default_for_test())
            .await
            .unwrap();
        let mut lock = NamedLock::new(
            client,
            &format!("lock-test-{}", Uuid::new_v4()),
            LockSettings::default(),
        );

        assert!(lock.acquire(true).await.unwrap());
        assert!(matches!(
            lock.acquire(false).await,
            Err(LockError::AlreadyLocked(_))
        ));
        lock.release().await.unwrap();
        assert!(lock.acquire(true).await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_contended_acquire_fails_fast_when_non_blocking() {
        let client = RedisClient::new(RedisConfig::default_for_test())
            .await
            .unwrap();
        let name = format!("lock-test-{}", Uuid::new_v4());

        let mut first = NamedLock::new(client.clone(), &name, LockSettings::default());
        let mut second = NamedLock::new(client, &name, LockSettings::default());

        assert!(first.acquire(true).await.unwrap());
        assert!(matches!(
            second.acquire(false).await,
            Err(LockError::AlreadyLocked(_))
        ));

        first.release().await.unwrap();
        assert!(second.acquire(true).await.unwrap());
        second.release().await.unwrap();
    }
}
