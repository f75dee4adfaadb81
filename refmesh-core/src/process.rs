/// Process identity, liveness, and orphan recovery
///
/// A `Process` represents one participant in the coordination mesh. It owns
/// an opaque unique id, a registry hash listing every resource it currently
/// references, and a background heartbeat task that republishes its liveness
/// into the shared heartbeat hash.
///
/// # Architecture
///
/// ```text
/// Process
///     ├─ shared store (first process constructed per address space wins)
///     ├─ registry: refmesh_{pid} -> {resource: 1, ...}
///     ├─ heartbeat task: every interval, lock -> HSET refmesh_heartbeat pid now -> release
///     └─ check_heartbeats: partition live/failed, redistribute failed registries
/// ```
///
/// A process is alive iff its heartbeat row is newer than
/// `now − 5·heartbeat_interval`. Dead processes' registries are enumerated
/// under their registry lock and their resources re-referenced by the
/// survivors, a fair prefix share each; strict uniqueness of assignment is
/// not required because re-referencing is idempotent in the reflist.
///
/// # Example
///
/// ```no_run
/// use refmesh_core::config::CoordinatorConfig;
/// use refmesh_core::process::Process;
///
/// # async fn example() -> anyhow::Result<()> {
/// let process = Process::start(CoordinatorConfig::from_env()?).await?;
/// let mut reference = process.create_reference("user.123").await?;
///
/// assert!(reference.count().await? >= 1);
///
/// reference.dereference(None).await?;
/// process.stop().await?;
/// # Ok(())
/// # }
/// ```

use crate::config::{ConfigError, CoordinatorConfig};
use crate::keys;
use crate::store::client::{RedisClient, RedisClientError, RedisConfig};
use crate::store::lock::{LockError, LockSettings, NamedLock};
use crate::reference::{now_timestamp, parse_timestamp, Reference, ReferenceError};
use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shared store connection failed
    #[error("Store client error: {0}")]
    Client(#[from] RedisClientError),

    /// Reference operation failed
    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),

    /// Lock operation failed
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Shared store unreachable or command failed
    #[error("Redis command error: {0}")]
    Store(#[from] redis::RedisError),
}

/// A process's rotatable identity
///
/// References hold an `Arc` of this instead of a back-pointer to the
/// `Process`, so Process -> Reference ownership stays acyclic. The id
/// rotates during self-recovery, and every holder observes the new identity
/// on its next store write.
pub struct ProcessIdentity {
    id: RwLock<String>,
}

impl ProcessIdentity {
    fn new() -> Self {
        Self {
            id: RwLock::new(Uuid::new_v4().to_string()),
        }
    }

    /// The current opaque process id.
    pub fn id(&self) -> String {
        self.id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registry key derived from the current id.
    pub fn registry_key(&self) -> String {
        keys::registry_key(&self.id())
    }

    /// Replaces the id with a fresh one, returning it. Used when the process
    /// finds its own heartbeat expired and must not collide with its failed
    /// identity.
    fn rotate(&self) -> String {
        let fresh = Uuid::new_v4().to_string();
        let mut id = self.id.write().unwrap_or_else(PoisonError::into_inner);
        *id = fresh.clone();
        fresh
    }
}

/// Outcome of one [`Process::check_heartbeats`] sweep.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Heartbeat rows examined
    pub scanned: usize,

    /// Rows older than the failure threshold
    pub failed: usize,

    /// Resources re-referenced by this process
    pub reclaimed: usize,

    /// Failed pids skipped (lock conflicts or errors); another sweep will
    /// revisit them
    pub skipped: usize,

    /// Whether this process rotated its own identity
    pub rotated_identity: bool,
}

/// The address-space-wide store connection, established by the first
/// process constructed.
struct SharedStore {
    client: RedisClient,
    lock_settings: LockSettings,
    address: RedisConfig,
}

static SHARED_STORE: OnceCell<SharedStore> = OnceCell::const_new();

/// First-wins connection setup. Later callers with a different address get
/// the established connection back, with a warning.
async fn shared_store(config: &CoordinatorConfig) -> Result<&'static SharedStore, ProcessError> {
    let shared = SHARED_STORE
        .get_or_try_init(|| async {
            let client = RedisClient::new(config.redis.clone()).await?;
            Ok::<_, RedisClientError>(SharedStore {
                client,
                lock_settings: LockSettings {
                    expire: config.ttl(),
                    retry_interval: config.retry_sleep(),
                    timeout: config.lock_timeout(),
                },
                address: config.redis.clone(),
            })
        })
        .await?;

    if !shared.address.same_address(&config.redis) {
        tracing::warn!(
            host = %shared.address.host,
            port = shared.address.port,
            db = shared.address.db,
            "An existing shared store connection exists; your connection parameters are being ignored"
        );
    }

    Ok(shared)
}

/// One participant in the coordination mesh
///
/// All references should be created through a process instance. Call
/// [`Process::stop`] when finished.
pub struct Process {
    identity: Arc<ProcessIdentity>,
    client: RedisClient,
    config: CoordinatorConfig,
    lock_settings: LockSettings,
    heartbeat_ref: Arc<TokioMutex<Reference>>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl Process {
    /// Starts a process: connects (or joins) the shared store, registers the
    /// heartbeat reference, publishes the first heartbeat, and spawns the
    /// heartbeat task.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration violates the liveness
    /// inequalities or the first store round-trips fail.
    pub async fn start(config: CoordinatorConfig) -> Result<Self, ProcessError> {
        config.validate()?;

        let shared = shared_store(&config).await?;
        let client = shared.client.clone();
        let lock_settings = shared.lock_settings.clone();
        let identity = Arc::new(ProcessIdentity::new());

        // The heartbeat hash is itself a referenced resource.
        let heartbeat_resource = keys::heartbeat_key();
        let mut conn = client.get_connection();
        let _: i64 = conn
            .hset(identity.registry_key(), &heartbeat_resource, 1)
            .await?;
        let heartbeat_ref = Arc::new(TokioMutex::new(
            Reference::open(
                identity.clone(),
                client.clone(),
                config.ttl(),
                lock_settings.clone(),
                &heartbeat_resource,
                true,
            )
            .await?,
        ));

        publish_heartbeat(&client, &identity, &heartbeat_ref).await?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            client.clone(),
            identity.clone(),
            heartbeat_ref.clone(),
            config.heartbeat_interval(),
            shutdown.clone(),
        ));

        tracing::info!(pid = %identity.id(), "Process started");

        Ok(Self {
            identity,
            client,
            config,
            lock_settings,
            heartbeat_ref,
            heartbeat_task: StdMutex::new(Some(handle)),
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    /// The current opaque process id.
    pub fn id(&self) -> String {
        self.identity.id()
    }

    /// Key of this process's registry hash.
    pub fn registry_key(&self) -> String {
        self.identity.registry_key()
    }

    /// The shared store client (one per address space).
    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    /// The configuration this process runs with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Creates a reference owned by this process, blocking on lock
    /// acquisition by default.
    pub async fn create_reference(&self, resource: &str) -> Result<Reference, ProcessError> {
        self.create_reference_with(resource, true).await
    }

    /// Creates a reference owned by this process
    ///
    /// Files the resource in the process registry, then binds a
    /// [`Reference`], which inserts this pid into the resource's reflist.
    ///
    /// # Arguments
    ///
    /// * `resource` - Identifier for the resource, e.g. `user.12345`
    /// * `block` - Whether lock acquisitions through the reference block
    pub async fn create_reference_with(
        &self,
        resource: &str,
        block: bool,
    ) -> Result<Reference, ProcessError> {
        self.add_to_registry(resource).await?;
        Ok(Reference::open(
            self.identity.clone(),
            self.client.clone(),
            self.config.ttl(),
            self.lock_settings.clone(),
            resource,
            block,
        )
        .await?)
    }

    /// Files `resource` in this process's registry; idempotent.
    pub async fn add_to_registry(&self, resource: &str) -> Result<(), ProcessError> {
        let mut conn = self.client.get_connection();
        let _: i64 = conn.hset(self.identity.registry_key(), resource, 1).await?;
        Ok(())
    }

    /// Removes `resource` from this process's registry; idempotent.
    pub async fn remove_from_registry(&self, resource: &str) -> Result<(), ProcessError> {
        let mut conn = self.client.get_connection();
        let _: i64 = conn.hdel(self.identity.registry_key(), resource).await?;
        Ok(())
    }

    /// Sweeps the heartbeat hash and redistributes failed processes'
    /// references
    ///
    /// Every surviving process runs the same sweep independently and claims
    /// a prefix-sized share of each failed registry. A process that finds
    /// its *own* heartbeat expired reclaims everything it had, under a fresh
    /// identity. Lock conflicts and per-pid errors are logged and skipped;
    /// another sweep will revisit.
    pub async fn check_heartbeats(&self) -> Result<RecoveryReport, ProcessError> {
        let mut conn = self.client.get_connection();
        let heartbeats: HashMap<String, String> = conn.hgetall(keys::heartbeat_key()).await?;

        let horizon = Utc::now() - self.config.failure_threshold();
        let mut failed = Vec::new();
        let mut live = 0usize;
        for (pid, stamp) in &heartbeats {
            match parse_timestamp(stamp) {
                Some(ts) if ts > horizon => live += 1,
                _ => failed.push(pid.clone()),
            }
        }

        let mut report = RecoveryReport {
            scanned: heartbeats.len(),
            failed: failed.len(),
            ..RecoveryReport::default()
        };
        let alive = live.max(1);

        for failed_pid in failed {
            match self.recover_failed_process(&failed_pid, alive).await {
                Ok(Some((reclaimed, rotated))) => {
                    report.reclaimed += reclaimed;
                    report.rotated_identity |= rotated;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(pid = %failed_pid, error = %e, "Recovery failed; skipping");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Recovers one failed process under its registry lock. Returns
    /// `Ok(None)` when the registry is locked by another survivor.
    async fn recover_failed_process(
        &self,
        failed_pid: &str,
        alive: usize,
    ) -> Result<Option<(usize, bool)>, ProcessError> {
        let failed_registry_key = keys::registry_key(failed_pid);
        let mut lock = NamedLock::new(
            self.client.clone(),
            &failed_registry_key,
            self.lock_settings.clone(),
        );

        match lock.acquire(false).await {
            Ok(_) => {}
            Err(LockError::AlreadyLocked(_)) => {
                tracing::info!(
                    pid = %failed_pid,
                    "Registry already locked by another survivor; skipping"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = self
            .reclaim_registry(failed_pid, &failed_registry_key, alive)
            .await;
        let released = lock.release().await;

        let outcome = outcome?;
        released?;
        Ok(Some(outcome))
    }

    async fn reclaim_registry(
        &self,
        failed_pid: &str,
        failed_registry_key: &str,
        alive: usize,
    ) -> Result<(usize, bool), ProcessError> {
        let mut conn = self.client.get_connection();
        let resources: Vec<String> = conn.hkeys(failed_registry_key).await?;

        let mut rotated = false;
        let claimed: Vec<String> = if failed_pid == self.identity.id() {
            // Self-declared dead: reclaim everything under a fresh identity.
            let fresh = self.identity.rotate();
            rotated = true;
            tracing::warn!(
                old_pid = %failed_pid,
                new_pid = %fresh,
                "Own heartbeat expired; rotating identity and reclaiming all references"
            );
            resources
        } else {
            let share = fair_share(resources.len(), alive);
            resources[..share].to_vec()
        };

        for resource in &claimed {
            self.create_reference(resource).await?;
        }

        if !claimed.is_empty() {
            let _: i64 = conn.hdel(failed_registry_key, claimed.clone()).await?;
            tracing::info!(
                pid = %failed_pid,
                reclaimed = claimed.len(),
                "Reclaimed orphaned references"
            );
        }

        let remaining: i64 = conn.hlen(failed_registry_key).await?;
        if remaining == 0 {
            let _: i64 = conn.hdel(keys::heartbeat_key(), failed_pid).await?;
        }

        Ok((claimed.len(), rotated))
    }

    /// Stops the process
    ///
    /// Cancels the heartbeat task, then dereferences the heartbeat
    /// reference under its lock. Idempotent and safe to call more than
    /// once.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        let handle = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut reference = self.heartbeat_ref.lock().await;
        if reference.lock().await? {
            reference.dereference(None).await?;
        }
        reference.release().await?;

        tracing::info!(pid = %self.identity.id(), "Process stopped");
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.shutdown.cancel();
            if let Ok(mut guard) = self.heartbeat_task.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Ceil division used for the prefix share each survivor claims.
fn fair_share(total: usize, alive: usize) -> usize {
    if total == 0 {
        return 0;
    }
    (total + alive - 1) / alive
}

/// Republishes this process's heartbeat row under the heartbeat lock.
async fn publish_heartbeat(
    client: &RedisClient,
    identity: &ProcessIdentity,
    heartbeat_ref: &TokioMutex<Reference>,
) -> Result<(), ProcessError> {
    let mut reference = heartbeat_ref.lock().await;
    if reference.lock().await? {
        let write: Result<(), ProcessError> = async {
            let mut conn = client.get_connection();
            let _: i64 = conn
                .hset(keys::heartbeat_key(), identity.id(), now_timestamp())
                .await?;
            Ok(())
        }
        .await;
        reference.release().await?;
        write?;
        tracing::trace!(pid = %identity.id(), "Heartbeat published");
    }
    Ok(())
}

/// The background heartbeat emitter. Store failures are logged and the loop
/// keeps its schedule.
async fn heartbeat_loop(
    client: RedisClient,
    identity: Arc<ProcessIdentity>,
    heartbeat_ref: Arc<TokioMutex<Reference>>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = publish_heartbeat(&client, &identity, &heartbeat_ref).await {
                    tracing::error!(error = %e, "Heartbeat publish failed; retrying on schedule");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rotation_changes_registry_key() {
        let identity = ProcessIdentity::new();
        let before_id = identity.id();
        let before_key = identity.registry_key();
        assert_eq!(before_key, keys::registry_key(&before_id));

        let fresh = identity.rotate();
        assert_ne!(fresh, before_id);
        assert_eq!(identity.id(), fresh);
        assert_eq!(identity.registry_key(), keys::registry_key(&fresh));
    }

    #[test]
    fn test_fair_share_is_ceil_division() {
        assert_eq!(fair_share(0, 3), 0);
        assert_eq!(fair_share(1, 3), 1);
        assert_eq!(fair_share(6, 3), 2);
        assert_eq!(fair_share(7, 3), 3);
        assert_eq!(fair_share(5, 1), 5);
    }

    #[test]
    fn test_recovery_report_accumulates() {
        let report = RecoveryReport {
            scanned: 4,
            failed: 2,
            reclaimed: 3,
            skipped: 1,
            rotated_identity: false,
        };
        assert_eq!(report.scanned, 4);
        assert_eq!(report.failed, 2);
        assert_eq!(report.reclaimed + report.skipped, 4);
    }
}
