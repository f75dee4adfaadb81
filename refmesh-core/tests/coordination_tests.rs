/// End-to-end coordination tests
///
/// These exercise the full protocol against a live store:
/// - Reference counting across processes
/// - Lock acquisition and non-reentrancy
/// - Session refresh and reflist cleanup
/// - Writer election (last sharer flushes the merged document)
/// - Orphan detection and recovery
///
/// All tests require a running Redis instance on localhost:6379 (db 1) and
/// are `#[ignore]`d by default:
///
/// ```bash
/// cargo test -p refmesh-core -- --ignored
/// ```

use redis::AsyncCommands;
use refmesh_core::config::CoordinatorConfig;
use refmesh_core::keys;
use refmesh_core::process::Process;
use refmesh_core::update::{Update, UpdatePayload, UserUpdate};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn unique_resource(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn start_process() -> Process {
    Process::start(CoordinatorConfig::default())
        .await
        .expect("process start (is Redis running on localhost:6379?)")
}

fn numeric_doc(pairs: &[(&str, f64)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_connection_parameters_of_later_processes_are_ignored() {
    // Establish the shared store with the real address first.
    let p1 = start_process().await;

    // A second process asking for an unreachable host still starts, because
    // the first connection wins and its parameters are ignored.
    let bogus = CoordinatorConfig {
        redis: refmesh_core::store::RedisConfig {
            host: "notlocalhost".to_string(),
            port: 123,
            ..refmesh_core::store::RedisConfig::default()
        },
        ..CoordinatorConfig::default()
    };
    let p2 = Process::start(bogus).await.expect("first connection wins");

    assert_ne!(p1.id(), p2.id());
    assert_eq!(p2.client().config().host, p1.client().config().host);
    assert_eq!(p2.client().config().port, p1.client().config().port);

    p2.stop().await.unwrap();
    p1.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_reference_creates_expected_keys() {
    let p = start_process().await;
    let resource = unique_resource("foo");
    let mut a = p.create_reference(&resource).await.unwrap();

    assert_eq!(a.reflist_key(), format!("refmesh_{}.reflist", resource));
    assert_eq!(a.resource_key(), resource);
    assert_eq!(
        a.times_modified_key(),
        format!("refmesh_{}.times_modified", resource)
    );

    // The owning pid is in the reflist immediately.
    let mut conn = p.client().get_connection();
    let stamp: Option<String> = conn.hget(a.reflist_key(), p.id()).await.unwrap();
    assert!(stamp.is_some());
    assert_eq!(a.count().await.unwrap(), 1);

    a.dereference(None).await.unwrap();
    p.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_lock_is_non_reentrant_and_releases() {
    let p = start_process().await;
    let resource = unique_resource("lock");
    let mut a = p.create_reference(&resource).await.unwrap();

    assert!(a.lock().await.unwrap());
    assert!(!a.lock_with(false).await.unwrap());
    a.release().await.unwrap();
    assert!(a.lock().await.unwrap());
    a.release().await.unwrap();

    a.dereference(None).await.unwrap();
    p.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_lock_excludes_other_processes() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let resource = unique_resource("lock");

    let mut a = p1.create_reference(&resource).await.unwrap();
    let mut b = p2.create_reference_with(&resource, false).await.unwrap();

    assert!(a.lock().await.unwrap());
    assert!(!b.lock().await.unwrap());
    a.release().await.unwrap();
    assert!(b.lock().await.unwrap());
    b.release().await.unwrap();

    a.dereference(None).await.unwrap();
    b.dereference(None).await.unwrap();
    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_refresh_session_advances_the_stored_timestamp() {
    let p = start_process().await;
    let resource = unique_resource("session");
    let mut a = p.create_reference(&resource).await.unwrap();

    let mut conn = p.client().get_connection();
    let before: String = conn.hget(a.reflist_key(), p.id()).await.unwrap();
    let before = chrono::DateTime::parse_from_rfc3339(&before).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    a.refresh_session().await.unwrap();

    let after: String = conn.hget(a.reflist_key(), p.id()).await.unwrap();
    let after = chrono::DateTime::parse_from_rfc3339(&after).unwrap();
    assert!(after > before, "expected {} > {}", after, before);

    a.dereference(None).await.unwrap();
    p.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_count_tracks_processes_sharing_a_resource() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let p3 = start_process().await;
    let resource = unique_resource("foo");

    let mut a = p1.create_reference(&resource).await.unwrap();
    let mut b = p2.create_reference(&resource).await.unwrap();
    let mut c = p3.create_reference(&resource).await.unwrap();

    assert_eq!(a.count().await.unwrap(), 3);
    assert_eq!(b.count().await.unwrap(), 3);
    assert_eq!(c.count().await.unwrap(), 3);

    a.dereference(None).await.unwrap();
    assert_eq!(b.count().await.unwrap(), 2);
    b.dereference(None).await.unwrap();
    assert_eq!(c.count().await.unwrap(), 1);
    c.dereference(None).await.unwrap();
    assert_eq!(c.count().await.unwrap(), 0);

    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
    p3.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_dereferencing_the_last_reference_deletes_all_keys() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let resource = unique_resource("cleanup");

    let mut a = p1.create_reference(&resource).await.unwrap();
    let mut b = p2.create_reference(&resource).await.unwrap();
    a.increment_times_modified().await.unwrap();

    a.dereference(None).await.unwrap();

    let mut conn = p1.client().get_connection();
    let reflist: HashMap<String, String> = conn.hgetall(a.reflist_key()).await.unwrap();
    assert!(!reflist.contains_key(&p1.id()));
    assert!(reflist.contains_key(&p2.id()));

    b.dereference(None).await.unwrap();

    let reflist_exists: bool = conn.exists(a.reflist_key()).await.unwrap();
    let resource_exists: bool = conn.exists(a.resource_key()).await.unwrap();
    let counter_exists: bool = conn.exists(a.times_modified_key()).await.unwrap();
    assert!(!reflist_exists);
    assert!(!resource_exists);
    assert!(!counter_exists);

    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_dereference_runs_the_callback_only_on_last() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let resource = unique_resource("hook");

    let mut a = p1.create_reference(&resource).await.unwrap();
    let mut b = p2.create_reference(&resource).await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    b.dereference(Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .await
    .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let counter = fired.clone();
    a.dereference(Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })))
    .await
    .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_times_modified_counts_across_processes() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let resource = unique_resource("counter");

    let mut a = p1.create_reference(&resource).await.unwrap();
    let mut b = p2.create_reference(&resource).await.unwrap();

    assert_eq!(a.get_times_modified().await.unwrap(), 0);
    a.increment_times_modified().await.unwrap();
    assert_eq!(a.get_times_modified().await.unwrap(), 1);
    a.increment_times_modified().await.unwrap();
    a.increment_times_modified().await.unwrap();
    assert_eq!(a.get_times_modified().await.unwrap(), 3);

    b.increment_times_modified().await.unwrap();
    assert_eq!(b.get_times_modified().await.unwrap(), 4);

    a.dereference(None).await.unwrap();
    b.dereference(None).await.unwrap();
    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_last_sharer_flushes_the_merged_document() {
    let p1 = start_process().await;
    let p2 = start_process().await;
    let resource = unique_resource("456");

    let mut b = UserUpdate::open(
        &p1,
        &resource,
        "test",
        "user",
        json!({"_id": resource.clone()}),
        numeric_doc(&[("d", 4.0), ("e", 5.0), ("f", 6.0)]),
    )
    .await
    .unwrap();
    let mut c = UserUpdate::open(
        &p2,
        &resource,
        "test",
        "user",
        json!({"_id": resource.clone()}),
        numeric_doc(&[("d", 4.0), ("e", 5.0), ("f", 6.0)]),
    )
    .await
    .unwrap();

    let mut conn = p1.client().get_connection();
    let cached: Option<String> = conn.get(&resource).await.unwrap();
    assert!(cached.is_none());
    assert_eq!(c.reference().count().await.unwrap(), 2);

    // First sharer out: caches, no downstream write.
    b.end_session().await.unwrap();
    assert_eq!(c.reference().count().await.unwrap(), 1);

    let cached: String = conn.get(&resource).await.unwrap();
    let cached: UpdatePayload = serde_json::from_str(&cached).unwrap();
    assert_eq!(cached.doc, numeric_doc(&[("d", 4.0), ("e", 5.0), ("f", 6.0)]));
    assert_eq!(cached.collection, "user");
    assert_eq!(cached.database, "test");

    let written: Option<String> = conn.get(keys::write_key(&resource)).await.unwrap();
    assert!(written.is_none());

    // Last sharer out: merges the cached delta and flushes downstream.
    c.end_session().await.unwrap();

    let written: String = conn.get(keys::write_key(&resource)).await.unwrap();
    let written: UpdatePayload = serde_json::from_str(&written).unwrap();
    assert_eq!(
        written.doc,
        numeric_doc(&[("d", 8.0), ("e", 10.0), ("f", 12.0)])
    );

    // The shared cache key went away with the last reference.
    let cached: Option<String> = conn.get(&resource).await.unwrap();
    assert!(cached.is_none());

    p1.stop().await.unwrap();
    p2.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_failed_process_registry_is_reclaimed() {
    let p = start_process().await;
    let dead_pid = format!("dead-{}", Uuid::new_v4());
    let resource = unique_resource("orphan");

    // Stage a process that died long ago: an expired heartbeat row and a
    // registry with one resource.
    let mut conn = p.client().get_connection();
    let expired = (chrono::Utc::now() - chrono::Duration::seconds(2 * 1800 + 1)).to_rfc3339();
    let _: i64 = conn
        .hset(keys::heartbeat_key(), &dead_pid, &expired)
        .await
        .unwrap();
    let _: i64 = conn
        .hset(keys::registry_key(&dead_pid), &resource, 1)
        .await
        .unwrap();

    let report = p.check_heartbeats().await.unwrap();
    assert!(report.failed >= 1);
    assert!(report.reclaimed >= 1);

    // The resource now belongs to the survivor.
    let registered: Option<String> = conn
        .hget(p.registry_key(), &resource)
        .await
        .unwrap();
    assert!(registered.is_some());
    let stamp: Option<String> = conn
        .hget(keys::reflist_key(&resource), p.id())
        .await
        .unwrap();
    assert!(stamp.is_some());

    // The dead process is fully retired.
    let dead_row: Option<String> = conn
        .hget(keys::heartbeat_key(), &dead_pid)
        .await
        .unwrap();
    assert!(dead_row.is_none());
    let dead_registry: i64 = conn.hlen(keys::registry_key(&dead_pid)).await.unwrap();
    assert_eq!(dead_registry, 0);

    p.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_self_recovery_rotates_identity() {
    // A slow heartbeat keeps the emitter from refreshing the row mid-test.
    let config = CoordinatorConfig {
        heartbeat_interval_secs: 60,
        ..CoordinatorConfig::default()
    };
    let p = Process::start(config).await.unwrap();
    let old_id = p.id();
    let resource = unique_resource("mine");
    let _r = p.create_reference(&resource).await.unwrap();

    // Backdate our own heartbeat far past the failure threshold.
    let mut conn = p.client().get_connection();
    let expired = (chrono::Utc::now() - chrono::Duration::seconds(2 * 1800 + 1)).to_rfc3339();
    let _: i64 = conn
        .hset(keys::heartbeat_key(), &old_id, &expired)
        .await
        .unwrap();

    let report = p.check_heartbeats().await.unwrap();
    assert!(report.rotated_identity);
    assert_ne!(p.id(), old_id);

    // Everything the failed identity held moved to the fresh one.
    let registered: Option<String> = conn
        .hget(keys::registry_key(&p.id()), &resource)
        .await
        .unwrap();
    assert!(registered.is_some());
    let old_registry: i64 = conn.hlen(keys::registry_key(&old_id)).await.unwrap();
    assert_eq!(old_registry, 0);
    let old_row: Option<String> = conn
        .hget(keys::heartbeat_key(), &old_id)
        .await
        .unwrap();
    assert!(old_row.is_none());

    p.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_stop_is_idempotent() {
    let p = start_process().await;
    p.stop().await.unwrap();
    p.stop().await.unwrap();
}
