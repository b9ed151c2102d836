//! End-to-end scenarios against the in-memory backend store (spec §8 S1-S6),
//! exercised without a live database.

use chrono::Utc;
use std::sync::Arc;
use topo_orchestrator::cluster::{inject_unseen_masters, read_cluster_name_by_master};
use topo_orchestrator::control::parse_detach_sentinel;
use topo_orchestrator::coordinates::{BinlogCoordinates, LogType};
use topo_orchestrator::instance::Instance;
use topo_orchestrator::key::InstanceKey;
use topo_orchestrator::prober::ProberConfig;
use topo_orchestrator::resolver::HostnameResolver;
use topo_orchestrator::scheduler::FleetScheduler;
use topo_orchestrator::store::memory::MemoryStore;
use topo_orchestrator::store::StoreGateway;
use topo_orchestrator::target::TargetConnector;

fn gateway() -> StoreGateway {
    StoreGateway::new(Arc::new(MemoryStore::new()))
}

/// A connector that never actually connects — fine for tests that only
/// exercise code paths reading from the in-memory store.
fn unused_connector() -> TargetConnector {
    TargetConnector::new(sqlx::mysql::MySqlConnectOptions::new().host("127.0.0.1").port(3306).username("root"))
}

/// S1: a fresh, unreplicated instance is discovered at depth 0 under its own
/// host:port cluster name, with `last_seen == last_checked`.
#[tokio::test]
async fn s1_discovery_of_a_fresh_instance() {
    let store = gateway();
    let key = InstanceKey::new("db1a", 3306);

    let mut instance = Instance::new(key.clone());
    instance.log_bin_enabled = true;
    let (cluster_name, depth) = read_cluster_name_by_master(&store, &instance)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    instance.cluster_name = cluster_name;
    instance.replication_depth = depth;

    let now = Utc::now();
    store.upsert(&instance, true, now).await.unwrap_or_else(|e| panic!("{e}"));

    let stored = store
        .read(&key)
        .await
        .unwrap_or_else(|e| panic!("{e}"))
        .unwrap_or_else(|| panic!("row exists"));
    assert_eq!(stored.cluster_name, "db1a:3306");
    assert_eq!(stored.replication_depth, 0);
    assert!(stored.slave_hosts.is_empty());
    assert_eq!(stored.last_seen, stored.last_checked);
}

/// S2: a child adopts its parent's already-established cluster name one
/// hop at a time.
#[tokio::test]
async fn s2_child_adopts_parent_cluster() {
    let store = gateway();
    let master_key = InstanceKey::new("db1a", 3306);

    let mut master = Instance::new(master_key.clone());
    master.cluster_name = "prod".to_string();
    master.replication_depth = 0;
    store.upsert(&master, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

    let mut child = Instance::new(InstanceKey::new("db2", 3306));
    child.master_key = master_key;
    child.slave_io_running = true;

    let (cluster_name, depth) = read_cluster_name_by_master(&store, &child)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(cluster_name, "prod");
    assert_eq!(depth, 1);
}

/// S3: a row referencing a never-seen master gets a skeletal placeholder
/// injected so the next probe cycle targets it.
#[tokio::test]
async fn s3_inject_missing_master() {
    let store = gateway();

    let mut child = Instance::new(InstanceKey::new("db3", 3306));
    child.master_key = InstanceKey::new("dbX", 3306);
    child.slave_io_running = true;
    store.upsert(&child, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

    let injected = inject_unseen_masters(&store).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(injected, 1);

    let master = store
        .read(&InstanceKey::new("dbX", 3306))
        .await
        .unwrap_or_else(|e| panic!("{e}"))
        .unwrap_or_else(|| panic!("injected row should exist"));
    assert_eq!(master.version, "Unknown");
    assert_eq!(master.cluster_name, "dbX:3306");
    assert!(master.last_checked.is_none());
}

/// S4: detach then reattach restores the exact coordinates recorded before
/// the detach.
#[test]
fn s4_detach_then_reattach_restores_coordinates() {
    let original = BinlogCoordinates::new("bin.000007", 4096, LogType::Binary);
    let sentinel_file = format!("//{}:{}", original.log_file, original.log_pos);

    let detached = BinlogCoordinates::new(sentinel_file, original.log_pos, LogType::Binary);
    assert_eq!(detached.log_file, "//bin.000007:4096");

    let (restored_file, restored_pos) =
        parse_detach_sentinel(&detached.log_file).unwrap_or_else(|| panic!("sentinel should parse"));
    let reattached = BinlogCoordinates::new(restored_file, restored_pos, LogType::Binary);
    assert!(reattached.equals(&original));
}

/// S6: `ReadOutdatedInstanceKeys` waits a full poll interval for a completed
/// probe, but 20x the poll interval for one whose attempt never returned.
#[tokio::test]
async fn s6_hung_probe_back_off() {
    let poll_interval_seconds = 10;
    let now = Utc::now();
    let key = InstanceKey::new("db1", 3306);

    // "At T + 100s": the attempt is still outstanding (last_attempted_check
    // > last_checked) but only 100s have passed since last_checked, short
    // of the 20x (200s) back-off window.
    let fixture = MemoryStore::new();
    let mut still_outstanding = Instance::new(key.clone());
    still_outstanding.last_checked = Some(now - chrono::Duration::seconds(101));
    still_outstanding.last_attempted_check = Some(now - chrono::Duration::seconds(100));
    fixture.seed(still_outstanding);

    let scheduler = FleetScheduler::new(
        unused_connector(),
        StoreGateway::new(Arc::new(fixture)),
        HostnameResolver::new(),
        ProberConfig::default(),
    );
    let outdated = scheduler
        .read_outdated_instance_keys(poll_interval_seconds)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(outdated.is_empty(), "100s < 20x the 10s poll interval; not yet outdated");

    // "At T + 210s": now 210s have passed since last_checked with the
    // attempt still outstanding — past the 20x back-off window.
    let fixture = MemoryStore::new();
    let mut hung = Instance::new(key.clone());
    hung.last_checked = Some(now - chrono::Duration::seconds(211));
    hung.last_attempted_check = Some(now - chrono::Duration::seconds(210));
    fixture.seed(hung);

    let scheduler = FleetScheduler::new(
        unused_connector(),
        StoreGateway::new(Arc::new(fixture)),
        HostnameResolver::new(),
        ProberConfig::default(),
    );
    let outdated = scheduler
        .read_outdated_instance_keys(poll_interval_seconds)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(outdated, vec![key]);
}
