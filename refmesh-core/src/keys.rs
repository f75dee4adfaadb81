/// Key naming for the shared store
///
/// Every coordination structure lives under the `refmesh` namespace prefix.
/// Key shapes:
///
/// ```text
/// refmesh_{resource}.reflist          - reflist hash (pid -> last refresh)
/// {resource}                          - cached resource snapshot
/// refmesh_{resource}.times_modified   - modification counter
/// refmesh_{resource}.lock             - distributed lock for the resource
/// refmesh_{pid}                       - per-process resource registry hash
/// refmesh_heartbeat                   - shared heartbeat hash (pid -> last seen)
/// {resource_id}.write                 - downstream write sink
/// ```

use crate::config::NAMESPACE;

/// Reflist hash for a resource: process id -> last session refresh timestamp.
pub fn reflist_key(resource: &str) -> String {
    format!("{}_{}.reflist", NAMESPACE, resource)
}

/// The resource value itself is stored under its own name, unprefixed.
pub fn resource_key(resource: &str) -> String {
    resource.to_string()
}

/// Monotonic modification counter for a resource.
pub fn times_modified_key(resource: &str) -> String {
    format!("{}_{}.times_modified", NAMESPACE, resource)
}

/// Distributed lock key for a resource.
pub fn lock_key(resource: &str) -> String {
    format!("{}_{}.lock", NAMESPACE, resource)
}

/// Per-process registry hash listing every resource the process references.
pub fn registry_key(pid: &str) -> String {
    format!("{}_{}", NAMESPACE, pid)
}

/// The shared heartbeat hash: process id -> last heartbeat timestamp.
pub fn heartbeat_key() -> String {
    format!("{}_heartbeat", NAMESPACE)
}

/// Downstream write sink for a flushed update.
pub fn write_key(resource_id: &str) -> String {
    format!("{}.write", resource_id)
}
