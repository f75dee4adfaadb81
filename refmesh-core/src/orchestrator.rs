/// Process lifecycle orchestration
///
/// The orchestrator wires the periodic pieces of a coordinating process
/// together: the orphan-recovery sweep over the heartbeat hash, and the
/// write-back cache's flush horizon. It runs until its shutdown token is
/// cancelled, then drains the cache and stops the process.
///
/// # Architecture
///
/// ```text
/// Orchestrator
///   ├─> every sweep interval:  Process::check_heartbeats
///   ├─> every flush interval:  LruCache::expire_all
///   └─> on shutdown:           drain cache, Process::stop
/// ```
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use refmesh_core::config::CoordinatorConfig;
/// use refmesh_core::orchestrator::Orchestrator;
/// use refmesh_core::process::Process;
///
/// # async fn example() -> anyhow::Result<()> {
/// let process = Arc::new(Process::start(CoordinatorConfig::from_env()?).await?);
/// let orchestrator: Orchestrator = Orchestrator::new(process);
///
/// let shutdown = orchestrator.shutdown_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.cancel();
/// });
///
/// orchestrator.run().await?;
/// # Ok(())
/// # }
/// ```

use crate::cache::{LruCache, SessionEntry};
use crate::process::{Process, ProcessError};
use crate::update::UserUpdate;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Orphan-recovery sweep period in seconds
    pub sweep_interval_secs: u64,

    /// Cache flush period in seconds; defaults to the process's session
    /// horizon
    pub flush_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            flush_interval_secs: 900,
        }
    }
}

/// Wires the heartbeat sweep and cache expiry to a process's lifecycle.
pub struct Orchestrator<K = String, E = UserUpdate> {
    process: Arc<Process>,
    cache: Option<Arc<Mutex<LruCache<K, E>>>>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
}

impl<K, E> Orchestrator<K, E>
where
    K: Hash + Eq + Clone + Send,
    E: SessionEntry,
{
    /// Creates an orchestrator for `process` with no cache to drive. The
    /// flush interval follows the process's session horizon.
    pub fn new(process: Arc<Process>) -> Self {
        let config = OrchestratorConfig {
            flush_interval_secs: process.config().session_length_secs,
            ..OrchestratorConfig::default()
        };
        Self {
            process,
            cache: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attaches a write-back cache to flush on the session horizon and
    /// drain at shutdown.
    pub fn with_cache(mut self, cache: Arc<Mutex<LruCache<K, E>>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Overrides the periodic intervals.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// The process being orchestrated.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Token for signalling shutdown from external handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the periodic loop until shutdown
    ///
    /// Sweep and flush failures are logged and the loop keeps its schedule;
    /// a retained cache entry stays inspectable through the cache handle.
    /// On shutdown the cache is drained and the process stopped.
    pub async fn run(&self) -> Result<(), ProcessError> {
        tracing::info!(
            pid = %self.process.id(),
            sweep_secs = self.config.sweep_interval_secs,
            flush_secs = self.config.flush_interval_secs,
            "Orchestrator starting"
        );

        let mut sweep =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        let mut flush =
            tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs.max(1)));
        // Consume the immediate first tick of each interval.
        sweep.tick().await;
        flush.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep_once().await,
                _ = flush.tick() => self.flush_cache().await,
            }
        }

        self.flush_cache().await;
        self.process.stop().await?;
        tracing::info!("Orchestrator shut down");
        Ok(())
    }

    async fn sweep_once(&self) {
        match self.process.check_heartbeats().await {
            Ok(report) if report.failed > 0 => {
                tracing::info!(
                    scanned = report.scanned,
                    failed = report.failed,
                    reclaimed = report.reclaimed,
                    skipped = report.skipped,
                    rotated = report.rotated_identity,
                    "Recovery sweep finished"
                );
            }
            Ok(report) => {
                tracing::debug!(scanned = report.scanned, "Recovery sweep found no failures");
            }
            Err(e) => {
                tracing::error!(error = %e, "Recovery sweep failed; retrying on schedule");
            }
        }
    }

    async fn flush_cache(&self) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().await;
            if let Err(e) = cache.expire_all().await {
                tracing::error!(error = %e, "Cache flush failed; entry retained");
            }
        }
    }
}
