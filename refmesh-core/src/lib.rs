//! # Refmesh Core
//!
//! Distributed reference counting for shared resources, coordinated through
//! a Redis-compatible store. Independent processes hold references to named
//! logical resources; the coordination layer maintains the per-resource
//! reference set, serializes mutation behind a TTL-bounded distributed
//! lock, write-back caches updates so the last sharer flushes the merged
//! state downstream, and recovers references orphaned by crashed processes
//! via a heartbeat protocol.
//!
//! ## Module Organization
//!
//! - `config`: coordination constants, env loading, liveness validation
//! - `keys`: key shapes under the `refmesh` namespace
//! - `store`: Redis client wrapper and the distributed named lock
//! - `reference`: per-(process, resource) handles and the reflist
//! - `process`: identity, registry, heartbeats, orphan recovery
//! - `update`: write-aggregated updates with last-sharer flush
//! - `cache`: bounded write-back LRU for pending updates
//! - `orchestrator`: periodic sweep/flush wiring and lifecycle

pub mod cache;
pub mod config;
pub mod keys;
pub mod orchestrator;
pub mod process;
pub mod reference;
pub mod store;
pub mod update;

pub use cache::{CacheError, LruCache, SessionEntry};
pub use config::{ConfigError, CoordinatorConfig, NAMESPACE};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use process::{Process, ProcessError, RecoveryReport};
pub use reference::{Reference, ReferenceError};
pub use update::{Update, UpdateError, UpdatePayload, UserUpdate};

/// Current version of the refmesh core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
