/// Distributed references to shared resources
///
/// A `Reference` is a per-(process, resource) handle. While it exists, the
/// owning process id is a field in the resource's reflist hash, valued with
/// the most recent session refresh timestamp. The union of all reflist
/// fields across processes is the distributed reference count.
///
/// A reference also owns the distributed lock for its resource: only the
/// lock holder may mutate the resource's persisted state.
///
/// # Lifecycle
///
/// ```text
/// Process::create_reference
///     │  HSET {ns}_{resource}.reflist <pid> <now>
///     ▼
/// refresh_session / count / lock / release ...
///     │
///     ▼
/// dereference
///     │  HDEL <pid>, compact expired rows
///     └─ reflist empty? -> DEL reflist, resource, times_modified; run callback
/// ```

use crate::keys;
use crate::process::ProcessIdentity;
use crate::store::client::RedisClient;
use crate::store::lock::{LockError, LockSettings, NamedLock};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Reference errors
#[derive(Error, Debug)]
pub enum ReferenceError {
    /// Lock layer error (timeout, store failure)
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Shared store unreachable or command failed
    #[error("Redis command error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Callback invoked exactly once when the last reference to a resource is
/// dropped.
pub type LastReferenceHook = Box<dyn FnOnce() + Send>;

/// Per-(process, resource) handle with reflist membership and the resource's
/// distributed lock.
pub struct Reference {
    resource: String,
    reflist_key: String,
    resource_key: String,
    times_modified_key: String,
    block: bool,
    identity: Arc<ProcessIdentity>,
    client: RedisClient,
    ttl: Duration,
    lock: NamedLock,
}

impl Reference {
    /// Binds a reference and inserts the owning process id into the reflist.
    ///
    /// Called through [`crate::process::Process::create_reference`], which
    /// also files the resource in the process registry.
    pub(crate) async fn open(
        identity: Arc<ProcessIdentity>,
        client: RedisClient,
        ttl: Duration,
        lock_settings: LockSettings,
        resource: &str,
        block: bool,
    ) -> Result<Self, ReferenceError> {
        let lock = NamedLock::new(client.clone(), resource, lock_settings);
        let reference = Self {
            resource: resource.to_string(),
            reflist_key: keys::reflist_key(resource),
            resource_key: keys::resource_key(resource),
            times_modified_key: keys::times_modified_key(resource),
            block,
            identity,
            client,
            ttl,
            lock,
        };

        reference.refresh_session().await?;
        Ok(reference)
    }

    /// The logical resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Key of the reflist hash.
    pub fn reflist_key(&self) -> &str {
        &self.reflist_key
    }

    /// Key the resource value itself is stored under.
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Key of the modification counter.
    pub fn times_modified_key(&self) -> &str {
        &self.times_modified_key
    }

    /// Default blocking behaviour for [`Reference::lock`].
    pub fn block(&self) -> bool {
        self.block
    }

    /// Acquires the resource's distributed lock with the default blocking
    /// behaviour. See [`Reference::lock_with`].
    pub async fn lock(&mut self) -> Result<bool, ReferenceError> {
        self.lock_with(self.block).await
    }

    /// Acquires the resource's distributed lock
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` when the lock is
    /// already held and `block` is false, including a second acquire from
    /// this same reference (non-reentrant). A blocking acquire that exceeds
    /// the configured timeout surfaces [`LockError::Timeout`]. The lock is
    /// TTL-bounded: a holder that dies without releasing expires out.
    pub async fn lock_with(&mut self, block: bool) -> Result<bool, ReferenceError> {
        match self.lock.acquire(block).await {
            Ok(acquired) => Ok(acquired),
            Err(LockError::AlreadyLocked(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the distributed lock if held; idempotent.
    pub async fn release(&mut self) -> Result<(), ReferenceError> {
        Ok(self.lock.release().await?)
    }

    /// Writes `pid -> now` into the reflist, extending this process's claim.
    pub async fn refresh_session(&self) -> Result<(), ReferenceError> {
        let mut conn = self.client.get_connection();
        let _: i64 = conn
            .hset(&self.reflist_key, self.identity.id(), now_timestamp())
            .await?;
        Ok(())
    }

    /// The distributed reference count
    ///
    /// Reads the reflist and counts the rows still inside the 2·TTL session
    /// window; rows from dead processes do not count, see
    /// [`remove_failed_processes`].
    pub async fn count(&self) -> Result<usize, ReferenceError> {
        let mut conn = self.client.get_connection();
        let rows: HashMap<String, String> = conn.hgetall(&self.reflist_key).await?;
        Ok(remove_failed_processes(&rows, self.ttl).len())
    }

    /// Filters a reflist snapshot down to its live rows. See the free
    /// function [`remove_failed_processes`].
    pub fn remove_failed_processes(
        &self,
        pids: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        remove_failed_processes(pids, self.ttl)
    }

    /// Reads the cached resource snapshot, if any process has written one.
    pub async fn get_resource(&self) -> Result<Option<String>, ReferenceError> {
        let mut conn = self.client.get_connection();
        Ok(conn.get(&self.resource_key).await?)
    }

    /// Current value of the modification counter.
    pub async fn get_times_modified(&self) -> Result<u64, ReferenceError> {
        let mut conn = self.client.get_connection();
        let raw: Option<String> = conn.get(&self.times_modified_key).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    /// Increments the modification counter, returning the new value.
    pub async fn increment_times_modified(&self) -> Result<u64, ReferenceError> {
        let mut conn = self.client.get_connection();
        Ok(conn.incr(&self.times_modified_key, 1u64).await?)
    }

    /// Drops this process's claim on the resource
    ///
    /// Removes the owning pid from the reflist and compacts out rows whose
    /// session expired. When the reflist empties, the reflist, resource, and
    /// times-modified keys are all deleted and `on_last` (if any) runs
    /// exactly once. The resource is also removed from the process registry.
    pub async fn dereference(
        &mut self,
        on_last: Option<LastReferenceHook>,
    ) -> Result<(), ReferenceError> {
        let pid = self.identity.id();
        let mut conn = self.client.get_connection();

        let _: i64 = conn.hdel(&self.reflist_key, &pid).await?;

        // Compact out expired rows.
        let rows: HashMap<String, String> = conn.hgetall(&self.reflist_key).await?;
        let live = remove_failed_processes(&rows, self.ttl);
        let expired: Vec<String> = rows
            .keys()
            .filter(|pid| !live.contains_key(*pid))
            .cloned()
            .collect();
        if !expired.is_empty() {
            tracing::debug!(
                resource = %self.resource,
                expired = expired.len(),
                "Compacting expired reflist rows"
            );
            let _: i64 = conn.hdel(&self.reflist_key, expired).await?;
        }

        if live.is_empty() {
            let _: i64 = conn
                .del(&[
                    self.reflist_key.as_str(),
                    self.resource_key.as_str(),
                    self.times_modified_key.as_str(),
                ])
                .await?;
            tracing::debug!(resource = %self.resource, "Last reference dropped; keys deleted");
            if let Some(hook) = on_last {
                hook();
            }
        }

        let _: i64 = conn.hdel(self.identity.registry_key(), &self.resource).await?;
        Ok(())
    }
}

/// Returns the subset of `pids` whose timestamp is more recent than
/// `now − 2·TTL`
///
/// Pure over its inputs apart from reading the clock; used to filter the
/// reference count and to compact the reflist on dereference. Rows with
/// unparseable timestamps are dropped and logged; a corrupt row must not
/// count as a live reference.
pub fn remove_failed_processes(
    pids: &HashMap<String, String>,
    ttl: Duration,
) -> HashMap<String, String> {
    let horizon = Utc::now() - chrono::Duration::seconds(2 * ttl.as_secs() as i64);

    pids.iter()
        .filter(|(pid, stamp)| match parse_timestamp(stamp) {
            Some(ts) => ts > horizon,
            None => {
                tracing::warn!(pid = %pid, stamp = %stamp, "Dropping unparseable reflist row");
                false
            }
        })
        .map(|(pid, stamp)| (pid.clone(), stamp.clone()))
        .collect()
}

/// Current time as the RFC 3339 UTC string persisted in reflists and the
/// heartbeat hash.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Parses a persisted timestamp back into UTC.
pub(crate) fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
