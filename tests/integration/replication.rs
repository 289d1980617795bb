//! Live replication status tests against a real PostgreSQL server
//!
//! These assume the server under test is a plain primary (not in recovery),
//! which is what a local development server is.

use std::sync::Arc;

use pgfleet::config::{HealthBands, PoolConfig};
use pgfleet::inventory::{
    Credentials, InstanceRole, InstanceStatus, ManagedInstance, MemoryInventory, SslMode,
    StaticCredentials,
};
use pgfleet::pool::PoolManager;
use pgfleet::replication::{HealthLevel, ReplicationStatus, ReplicationTracker};

use crate::{get_pg_config, skip_if_not_enabled, test_tracker, TEST_CLUSTER, TEST_INSTANCE};

#[tokio::test]
async fn test_replication_status_primary_view() {
    skip_if_not_enabled!();
    let tracker = test_tracker();

    let status = tracker
        .get_replication_status(TEST_INSTANCE)
        .await
        .expect("status query failed");

    match status {
        ReplicationStatus::Primary { wal, archiver, .. } => {
            assert!(!wal.current_lsn.is_empty());
            assert!(archiver.archived_count >= 0);
        }
        ReplicationStatus::Standby { .. } => panic!("test server unexpectedly in recovery"),
    }
}

#[tokio::test]
async fn test_lag_not_applicable_on_primary() {
    skip_if_not_enabled!();
    let tracker = test_tracker();

    let lag = tracker
        .calculate_replication_lag(TEST_INSTANCE)
        .await
        .expect("lag query failed");
    assert_eq!(lag.lag_bytes, 0);
    assert!(lag.lag_seconds.is_none());
}

#[tokio::test]
async fn test_cluster_topology_resolves_role() {
    skip_if_not_enabled!();
    let tracker = test_tracker();

    let topology = tracker
        .get_cluster_topology(TEST_CLUSTER)
        .await
        .expect("topology failed");

    assert_eq!(topology.instances.len(), 1);
    let entry = &topology.instances[0];
    assert_eq!(entry.role, InstanceRole::Primary);
    assert!(entry.error.is_none());
    assert!(entry.healthy);
    assert_eq!(topology.primary().unwrap().instance_id, TEST_INSTANCE);
}

fn cluster_instance(id: &str, host: &str, port: u16, connect_timeout_ms: u64) -> ManagedInstance {
    let pg = get_pg_config();
    ManagedInstance {
        id: id.to_string(),
        host: host.to_string(),
        port,
        credential_ref: None,
        database: pg.database,
        ssl_mode: SslMode::Prefer,
        max_connections: 4,
        connect_timeout_ms,
        role: InstanceRole::Unknown,
        status: InstanceStatus::Healthy,
    }
}

#[tokio::test]
async fn test_topology_isolates_single_unreachable_instance() {
    skip_if_not_enabled!();
    let pg = get_pg_config();

    // Two entries point at the live server, one at a dead port. The dead
    // member must degrade alone; the reachable ones still resolve.
    let inventory = Arc::new(MemoryInventory::new());
    inventory.register("mixed", cluster_instance("pg-a", &pg.host, pg.port, 5000));
    inventory.register("mixed", cluster_instance("pg-b", &pg.host, pg.port, 5000));
    inventory.register("mixed", cluster_instance("pg-dead", "127.0.0.1", 1, 300));

    let fallback = Credentials {
        username: pg.user.clone(),
        password: pg.password.clone(),
    };
    let manager = Arc::new(PoolManager::new(
        inventory.clone(),
        Arc::new(StaticCredentials::new(fallback.clone())),
        fallback,
        PoolConfig::default(),
    ));
    let tracker = ReplicationTracker::new(manager, inventory, HealthBands::default());

    let topology = tracker
        .get_cluster_topology("mixed")
        .await
        .expect("topology failed");
    assert_eq!(topology.instances.len(), 3);

    let degraded: Vec<_> = topology
        .instances
        .iter()
        .filter(|i| i.error.is_some())
        .collect();
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0].instance_id, "pg-dead");
    assert_eq!(degraded[0].role, InstanceRole::Unknown);
    assert!(!degraded[0].healthy);

    for entry in topology.instances.iter().filter(|i| i.error.is_none()) {
        assert_eq!(entry.role, InstanceRole::Primary);
        assert!(entry.healthy);
    }
    assert!(topology.primary().is_some());
}

#[tokio::test]
async fn test_health_classification_is_consistent() {
    skip_if_not_enabled!();
    let tracker = test_tracker();

    let health = tracker
        .check_replication_health(TEST_INSTANCE)
        .await
        .expect("health check failed");

    match health.level {
        HealthLevel::Healthy => {
            assert!(health.issues.is_empty());
            assert!(health.warnings.is_empty());
        }
        HealthLevel::Warning => assert!(!health.warnings.is_empty()),
        HealthLevel::Critical => assert!(!health.issues.is_empty()),
    }
}

#[tokio::test]
async fn test_standby_and_slot_listings() {
    skip_if_not_enabled!();
    let tracker = test_tracker();

    // A plain dev server has no standbys attached; the calls still succeed
    let standbys = tracker
        .get_standby_list(TEST_INSTANCE)
        .await
        .expect("standby list failed");
    for standby in &standbys {
        assert!(standby.pid > 0);
    }

    let slots = tracker
        .get_replication_slots(TEST_INSTANCE)
        .await
        .expect("slot list failed");
    for slot in &slots {
        assert!(!slot.slot_name.is_empty());
    }
}
