use serde::Deserialize;

use crate::inventory::{InstanceRole, SslMode};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Connection pool tuning
    #[serde(default)]
    pub pool: PoolConfig,
    /// Development-default credentials (used when an instance has no
    /// credential reference)
    #[serde(default)]
    pub credentials: CredentialConfig,
    /// Failover orchestration tuning
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Replication health thresholds
    #[serde(default)]
    pub health: HealthBands,
    /// Managed clusters (seed inventory)
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for the Prometheus scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9187".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
        }
    }
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration shared by all instance pools
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of idle connections kept per instance pool
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Maximum connection age before recycling (seconds)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Pools unused longer than this are evicted (seconds)
    #[serde(default = "default_idle_pool_timeout_secs")]
    pub idle_pool_timeout_secs: u64,
    /// Interval of the idle-pool eviction timer (seconds)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Default connect timeout when an instance does not specify one (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_idle() -> usize {
    8
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_idle_pool_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_cleanup_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_age_secs: default_max_age_secs(),
            idle_pool_timeout_secs: default_idle_pool_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// ============================================================================
// Credential Configuration
// ============================================================================

/// Fallback credentials for instances without a credential reference
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_username() -> String {
    "postgres".to_string()
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: String::new(),
        }
    }
}

// ============================================================================
// Failover Configuration
// ============================================================================

/// Failover orchestration tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// How many times to poll the promotion target for leaving recovery
    #[serde(default = "default_promote_poll_attempts")]
    pub promote_poll_attempts: u32,
    /// Interval between promotion polls (ms)
    #[serde(default = "default_promote_poll_interval_ms")]
    pub promote_poll_interval_ms: u64,
    /// Maximum replay lag a switchover candidate may have (seconds)
    #[serde(default = "default_switchover_max_lag_secs")]
    pub switchover_max_lag_secs: f64,
}

fn default_promote_poll_attempts() -> u32 {
    30
}

fn default_promote_poll_interval_ms() -> u64 {
    1000
}

fn default_switchover_max_lag_secs() -> f64 {
    5.0
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            promote_poll_attempts: default_promote_poll_attempts(),
            promote_poll_interval_ms: default_promote_poll_interval_ms(),
            switchover_max_lag_secs: default_switchover_max_lag_secs(),
        }
    }
}

// ============================================================================
// Replication Health Bands
// ============================================================================

/// Lag thresholds for replication health classification
#[derive(Debug, Clone, Deserialize)]
pub struct HealthBands {
    /// Replay lag above this is a warning (seconds)
    #[serde(default = "default_warning_lag_secs")]
    pub warning_lag_secs: f64,
    /// Replay lag above this is critical (seconds)
    #[serde(default = "default_critical_lag_secs")]
    pub critical_lag_secs: f64,
}

fn default_warning_lag_secs() -> f64 {
    60.0
}

fn default_critical_lag_secs() -> f64 {
    300.0
}

impl Default for HealthBands {
    fn default() -> Self {
        Self {
            warning_lag_secs: default_warning_lag_secs(),
            critical_lag_secs: default_critical_lag_secs(),
        }
    }
}

// ============================================================================
// Cluster / Instance Configuration
// ============================================================================

/// A managed PostgreSQL cluster (seed inventory entry)
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Unique cluster identifier
    pub id: String,
    /// Instances in this cluster
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// A managed PostgreSQL server
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance identifier
    pub id: String,
    /// Hostname or IP
    pub host: String,
    /// Port number
    #[serde(default = "default_pg_port")]
    pub port: u16,
    /// Credential reference resolved through the credential store
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Database to connect to
    #[serde(default = "default_database")]
    pub database: String,
    /// SSL mode for connections
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Maximum pooled connections to this instance
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connect timeout (ms); falls back to the pool-wide default when absent
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Configured role (refined by live topology probes)
    #[serde(default)]
    pub role: InstanceRole,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl InstanceConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
