/// Bounded write-back cache for pending updates
///
/// The `LruCache` batches updates in-process, keyed by resource id.
/// Repeated updates to the same key are coalesced with `merge`; when the
/// cache fills, the least-recently-used entry is evicted and flushed via
/// `end_session`, which is also how explicit expiry works.
///
/// The cache is in-process state, accessed only on the owning process's
/// tasks; cross-process coordination happens entirely through the shared
/// store when entries flush.
///
/// # Failure handling
///
/// A flush that fails does not poison the cache: the offending entry is
/// retained and retrievable via [`LruCache::get_last_failed`] for
/// operator-driven inspection or retry, and the error surfaces to the
/// caller of the triggering operation.
///
/// # Example
///
/// ```no_run
/// use refmesh_core::cache::LruCache;
/// use refmesh_core::update::UserUpdate;
///
/// # async fn example(update: UserUpdate) -> anyhow::Result<()> {
/// let mut cache: LruCache<String, UserUpdate> = LruCache::new(5);
/// cache.set("user.456".to_string(), update).await?;
/// assert_eq!(cache.size(), 1);
///
/// cache.expire_all().await?;
/// # Ok(())
/// # }
/// ```

use crate::update::UpdateError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use thiserror::Error;

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// An entry's `end_session` raised during expiry or eviction; the entry
    /// is retained in the last-failed slot
    #[error("Flush failed during expiry: {0}")]
    FlushFailed(#[source] UpdateError),
}

/// What the cache requires of its entries
///
/// Every [`crate::update::Update`] implementation satisfies this via a
/// blanket impl; tests substitute probe entries.
#[async_trait]
pub trait SessionEntry: Send {
    /// Coalesces a newer entry for the same key into this one.
    fn merge(&mut self, other: Self)
    where
        Self: Sized;

    /// Terminates the entry's session, flushing or caching as appropriate.
    async fn end_session(&mut self) -> Result<(), UpdateError>;
}

/// Bounded in-memory map of pending updates with LRU eviction
///
/// `set` on an existing key merges and promotes the resident entry; `get`
/// is a read probe and leaves recency unchanged.
pub struct LruCache<K, E> {
    entries: HashMap<K, E>,
    /// Recency order, least recently used at the front.
    order: VecDeque<K>,
    max_entries: usize,
    last_failed: Option<E>,
}

impl<K, E> LruCache<K, E>
where
    K: Hash + Eq + Clone,
    E: SessionEntry,
{
    /// Creates a cache holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_entries),
            order: VecDeque::with_capacity(max_entries),
            max_entries,
            last_failed: None,
        }
    }

    /// Current entry count.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Inserts or coalesces an update
    ///
    /// An existing key has `update` merged *into* the resident entry and is
    /// promoted to most recently used. A new key may first evict (and
    /// flush) the least-recently-used entry; a failed flush is retained in
    /// the last-failed slot and surfaced, but the new entry is still
    /// inserted.
    pub async fn set(&mut self, key: K, update: E) -> Result<(), CacheError> {
        if let Some(resident) = self.entries.get_mut(&key) {
            resident.merge(update);
            self.promote(&key);
            return Ok(());
        }

        let evicted = if self.entries.len() == self.max_entries {
            self.expire_oldest().await
        } else {
            Ok(())
        };

        self.entries.insert(key.clone(), update);
        self.order.push_back(key);
        evicted
    }

    /// Read probe; does not change recency.
    pub fn get(&self, key: &K) -> Option<&E> {
        self.entries.get(key)
    }

    /// Removes and flushes the entry at `key`; absent keys are a no-op.
    pub async fn expire(&mut self, key: &K) -> Result<(), CacheError> {
        match self.remove(key) {
            Some(entry) => self.finish(entry).await,
            None => Ok(()),
        }
    }

    /// Removes and flushes the least-recently-used entry.
    pub async fn expire_oldest(&mut self) -> Result<(), CacheError> {
        let oldest = match self.order.front().cloned() {
            Some(key) => key,
            None => return Ok(()),
        };
        self.expire(&oldest).await
    }

    /// Removes and flushes every entry, oldest first
    ///
    /// Keeps going past a failed flush; the first failure is retained and
    /// returned once the cache is drained.
    pub async fn expire_all(&mut self) -> Result<(), CacheError> {
        let mut first_failure = None;

        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                if let Err(e) = self.finish(entry).await {
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The most recent entry whose flush failed, if any. The entry stays
    /// retrievable until replaced by a later failure or reclaimed with
    /// [`LruCache::take_last_failed`].
    pub fn get_last_failed(&self) -> Option<&E> {
        self.last_failed.as_ref()
    }

    /// Reclaims the failed entry for a retry.
    pub fn take_last_failed(&mut self) -> Option<E> {
        self.last_failed.take()
    }

    fn promote(&mut self, key: &K) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        self.order.push_back(key.clone());
    }

    fn remove(&mut self, key: &K) -> Option<E> {
        let entry = self.entries.remove(key)?;
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
        Some(entry)
    }

    async fn finish(&mut self, mut entry: E) -> Result<(), CacheError> {
        match entry.end_session().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "Flush failed; retaining entry");
                self.last_failed = Some(entry);
                Err(CacheError::FlushFailed(e))
            }
        }
    }
}
