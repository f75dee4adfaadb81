/// Write-aggregated resource updates
///
/// An `Update` describes one session of mutation against a shared resource.
/// It piggybacks on the resource's reflist to elect a single writer: when a
/// session ends with other sharers still live, the update only *caches* its
/// snapshot into the shared store; the last sharer folds every cached delta
/// into its own document and *executes* the authoritative downstream write.
///
/// # Session protocol
///
/// ```text
/// open        -> reference the resource (pid joins the reflist)
/// end_session -> refresh session
///                count() > 1 ? cache()                 (fast, shared store)
///                            : merge cached + execute() (downstream write)
///                dereference (last one out deletes the cached snapshot)
/// ```
///
/// Two sharers caching to the same key race last-writer-wins; that is the
/// intended design; do not attempt to linearize the caches.
///
/// # Example
///
/// ```no_run
/// use refmesh_core::config::CoordinatorConfig;
/// use refmesh_core::process::Process;
/// use refmesh_core::update::{Update, UserUpdate};
/// use serde_json::{json, Map};
///
/// # async fn example() -> anyhow::Result<()> {
/// let process = Process::start(CoordinatorConfig::from_env()?).await?;
///
/// let mut doc = Map::new();
/// doc.insert("clicks".to_string(), json!(3.0));
///
/// let mut update = UserUpdate::open(
///     &process, "user.456", "analytics", "user", json!({"_id": 456}), doc,
/// ).await?;
///
/// update.end_session().await?;
/// # Ok(())
/// # }
/// ```

use crate::cache::SessionEntry;
use crate::keys;
use crate::process::{Process, ProcessError};
use crate::store::client::RedisClient;
use crate::reference::{Reference, ReferenceError};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Update errors
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Reference operation failed
    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),

    /// Could not open the backing reference
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Shared store unreachable or command failed
    #[error("Redis command error: {0}")]
    Store(#[from] redis::RedisError),

    /// Snapshot (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Domain-level flush failure
    #[error("Update failed: {0}")]
    Failed(String),
}

/// The self-describing snapshot an update persists
///
/// Written verbatim by `cache()` (under the resource id) and `execute()`
/// (under `{resource_id}.write` or a downstream datastore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Accumulated document
    pub doc: Map<String, Value>,

    /// Selector for the downstream write
    pub spec: Value,

    /// Downstream collection
    pub collection: String,

    /// Downstream database
    pub database: String,
}

/// A resource-mutation descriptor with merge/cache/execute
///
/// Implementations supply the domain-specific accumulation and the two
/// persistence paths; `end_session` is the provided writer-election
/// template. Every `Update` automatically satisfies the cache's
/// [`SessionEntry`] contract.
#[async_trait]
pub trait Update: Send {
    /// The reference backing this update's session.
    fn reference(&self) -> &Reference;

    /// Mutable access to the backing reference (needed to dereference).
    fn reference_mut(&mut self) -> &mut Reference;

    /// Snapshot of the current accumulated state.
    fn payload(&self) -> UpdatePayload;

    /// Domain-specific accumulation of another snapshot into this one.
    fn merge_payload(&mut self, other: UpdatePayload);

    /// Persists the snapshot into the shared store, keyed by the resource
    /// id. Fast; no downstream write.
    async fn cache(&mut self) -> Result<(), UpdateError>;

    /// Flushes the snapshot to the authoritative downstream. Called exactly
    /// once per logical session, by the last sharer.
    async fn execute(&mut self) -> Result<(), UpdateError>;

    /// Ends the session
    ///
    /// The last live sharer is elected writer: it folds the cached peers'
    /// snapshot into its own document and executes the downstream write.
    /// Everyone else caches and leaves. Either way the session's reference
    /// is dropped, and the final dereference deletes the cached snapshot
    /// along with the reflist.
    async fn end_session(&mut self) -> Result<(), UpdateError> {
        self.reference().refresh_session().await?;

        if self.reference().count().await? > 1 {
            self.cache().await?;
        } else {
            if let Some(raw) = self.reference().get_resource().await? {
                match serde_json::from_str::<UpdatePayload>(&raw) {
                    Ok(cached) => self.merge_payload(cached),
                    Err(e) => tracing::warn!(
                        resource = %self.reference().resource(),
                        error = %e,
                        "Ignoring unparseable cached snapshot"
                    ),
                }
            }
            self.execute().await?;
        }

        self.reference_mut().dereference(None).await?;
        Ok(())
    }
}

#[async_trait]
impl<U: Update> SessionEntry for U {
    fn merge(&mut self, other: Self) {
        let payload = other.payload();
        self.merge_payload(payload);
    }

    async fn end_session(&mut self) -> Result<(), UpdateError> {
        Update::end_session(self).await
    }
}

/// The canonical update flavour: a numeric document accumulated field-wise
///
/// Merging adds numeric fields together (`{d:4}` merged with `{d:4}` gives
/// `{d:8}`); non-numeric collisions keep the incoming value.
pub struct UserUpdate {
    resource_id: String,
    payload: UpdatePayload,
    reference: Reference,
    client: RedisClient,
}

impl UserUpdate {
    /// Opens an update session on `resource_id`
    ///
    /// References the resource through `process`, so the reflist contains
    /// this process immediately after construction.
    pub async fn open(
        process: &Process,
        resource_id: &str,
        database: &str,
        collection: &str,
        spec: Value,
        doc: Map<String, Value>,
    ) -> Result<Self, UpdateError> {
        let reference = process.create_reference(resource_id).await?;
        reference.refresh_session().await?;

        Ok(Self {
            resource_id: resource_id.to_string(),
            payload: UpdatePayload {
                doc,
                spec,
                collection: collection.to_string(),
                database: database.to_string(),
            },
            reference,
            client: process.client().clone(),
        })
    }

    /// The resource this update targets.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// The accumulated document so far.
    pub fn doc(&self) -> &Map<String, Value> {
        &self.payload.doc
    }
}

#[async_trait]
impl Update for UserUpdate {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn reference_mut(&mut self) -> &mut Reference {
        &mut self.reference
    }

    fn payload(&self) -> UpdatePayload {
        self.payload.clone()
    }

    fn merge_payload(&mut self, other: UpdatePayload) {
        merge_docs(&mut self.payload.doc, other.doc);
    }

    async fn cache(&mut self) -> Result<(), UpdateError> {
        let snapshot = serde_json::to_string(&self.payload)?;
        let mut conn = self.client.get_connection();
        let _: () = conn.set(&self.resource_id, snapshot).await?;
        self.reference.increment_times_modified().await?;
        tracing::debug!(resource = %self.resource_id, "Cached update snapshot");
        Ok(())
    }

    async fn execute(&mut self) -> Result<(), UpdateError> {
        let snapshot = serde_json::to_string(&self.payload)?;
        let mut conn = self.client.get_connection();
        let _: () = conn.set(keys::write_key(&self.resource_id), snapshot).await?;
        tracing::debug!(resource = %self.resource_id, "Executed downstream write");
        Ok(())
    }
}

/// Field-wise additive merge: numeric fields are summed, everything else is
/// overwritten by the incoming value.
pub fn merge_docs(dest: &mut Map<String, Value>, src: Map<String, Value>) {
    for (field, incoming) in src {
        match (dest.get(&field).and_then(Value::as_f64), incoming.as_f64()) {
            (Some(existing), Some(addend)) => {
                dest.insert(field, Value::from(existing + addend));
            }
            _ => {
                dest.insert(field, incoming);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, f64)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_merge_docs_adds_numeric_fields() {
        let mut dest = doc(&[("d", 4.0), ("e", 5.0), ("f", 6.0)]);
        merge_docs(&mut dest, doc(&[("d", 4.0), ("e", 5.0), ("f", 6.0)]));

        assert_eq!(dest.get("d").and_then(Value::as_f64), Some(8.0));
        assert_eq!(dest.get("e").and_then(Value::as_f64), Some(10.0));
        assert_eq!(dest.get("f").and_then(Value::as_f64), Some(12.0));
    }

    #[test]
    fn test_merge_docs_inserts_missing_fields() {
        let mut dest = doc(&[("a", 1.0)]);
        merge_docs(&mut dest, doc(&[("b", 2.0)]));

        assert_eq!(dest.get("a").and_then(Value::as_f64), Some(1.0));
        assert_eq!(dest.get("b").and_then(Value::as_f64), Some(2.0));
    }

    #[test]
    fn test_merge_docs_overwrites_non_numeric_collisions() {
        let mut dest = Map::new();
        dest.insert("name".to_string(), json!("before"));

        let mut src = Map::new();
        src.insert("name".to_string(), json!("after"));
        merge_docs(&mut dest, src);

        assert_eq!(dest.get("name"), Some(&json!("after")));
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = UpdatePayload {
            doc: doc(&[("a", 1.0)]),
            spec: json!({"_id": 456}),
            collection: "user".to_string(),
            database: "test".to_string(),
        };

        let raw = serde_json::to_string(&payload).unwrap();
        let parsed: UpdatePayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, payload);
    }
}
