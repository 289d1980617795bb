//! Integration test entry point
//!
//! Run with: PGFLEET_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - PGFLEET_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - PGFLEET_TEST_PG_HOST: PostgreSQL host (default: 127.0.0.1)
//! - PGFLEET_TEST_PG_PORT: PostgreSQL port (default: 5432)
//! - PGFLEET_TEST_PG_USER: PostgreSQL user (default: postgres)
//! - PGFLEET_TEST_PG_PASS: PostgreSQL password (default: empty)
//! - PGFLEET_TEST_PG_DB: Database name (default: postgres)

mod pool;
mod replication;

use std::env;
use std::sync::Arc;

use pgfleet::config::{HealthBands, PoolConfig};
use pgfleet::inventory::{
    Credentials, InstanceRole, InstanceStatus, ManagedInstance, MemoryInventory, SslMode,
    StaticCredentials,
};
use pgfleet::pool::PoolManager;
use pgfleet::replication::ReplicationTracker;

pub const TEST_CLUSTER: &str = "test-cluster";
pub const TEST_INSTANCE: &str = "pg-test";

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("PGFLEET_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set PGFLEET_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// PostgreSQL server under test
#[derive(Debug, Clone)]
pub struct PgTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Get server connection config from environment
pub fn get_pg_config() -> PgTestConfig {
    PgTestConfig {
        host: env::var("PGFLEET_TEST_PG_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("PGFLEET_TEST_PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432),
        user: env::var("PGFLEET_TEST_PG_USER").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("PGFLEET_TEST_PG_PASS").unwrap_or_default(),
        database: env::var("PGFLEET_TEST_PG_DB").unwrap_or_else(|_| "postgres".to_string()),
    }
}

/// Pool manager plus the inventory it reads, seeded with one instance
/// pointing at the server under test
pub fn test_fixture() -> (Arc<PoolManager>, Arc<MemoryInventory>) {
    let pg = get_pg_config();

    let inventory = Arc::new(MemoryInventory::new());
    inventory.register(
        TEST_CLUSTER,
        ManagedInstance {
            id: TEST_INSTANCE.to_string(),
            host: pg.host.clone(),
            port: pg.port,
            credential_ref: None,
            database: pg.database.clone(),
            ssl_mode: SslMode::Prefer,
            max_connections: 4,
            connect_timeout_ms: 5000,
            role: InstanceRole::Unknown,
            status: InstanceStatus::Healthy,
        },
    );

    let fallback = Credentials {
        username: pg.user,
        password: pg.password,
    };
    let manager = Arc::new(PoolManager::new(
        inventory.clone(),
        Arc::new(StaticCredentials::new(fallback.clone())),
        fallback,
        PoolConfig::default(),
    ));
    (manager, inventory)
}

/// Replication tracker over the test fixture
pub fn test_tracker() -> ReplicationTracker {
    let (manager, inventory) = test_fixture();
    ReplicationTracker::new(manager, inventory, HealthBands::default())
}
