//! Inventory and credential collaborator interfaces
//!
//! The fleet core reads managed-instance descriptions from an inventory
//! service and writes role/status back after topology probes and failover
//! actions. Inventory CRUD itself lives outside this crate; the traits here
//! are the boundary, and the in-memory implementations back the binary
//! (seeded from TOML config) and the tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, CredentialConfig};

/// Role of a managed PostgreSQL server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Primary,
    Standby,
    #[default]
    Unknown,
}

/// Operational status of a managed PostgreSQL server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Online,
    Offline,
    Degraded,
    #[default]
    Healthy,
}

/// SSL mode requested for connections to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl From<SslMode> for tokio_postgres::config::SslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require => tokio_postgres::config::SslMode::Require,
        }
    }
}

/// A PostgreSQL server under management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedInstance {
    /// Unique instance identifier
    pub id: String,
    /// Hostname or IP
    pub host: String,
    /// Port number
    pub port: u16,
    /// Credential reference resolved through the credential store
    pub credential_ref: Option<String>,
    /// Database to connect to
    pub database: String,
    /// SSL mode for connections
    pub ssl_mode: SslMode,
    /// Maximum pooled connections to this instance
    pub max_connections: u32,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Current role
    pub role: InstanceRole,
    /// Current status
    pub status: InstanceStatus,
}

impl ManagedInstance {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_primary(&self) -> bool {
        self.role == InstanceRole::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.role == InstanceRole::Standby
    }
}

/// Decrypted credentials for connecting to an instance
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Read/write boundary to the inventory collaborator
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Look up a single instance by id
    async fn instance(&self, id: &str) -> Option<ManagedInstance>;

    /// All instances belonging to a cluster
    async fn cluster_instances(&self, cluster_id: &str) -> Vec<ManagedInstance>;

    /// Whether a cluster is known to the inventory
    async fn cluster_exists(&self, cluster_id: &str) -> bool;

    /// Write back role/status after a topology probe or failover action
    async fn set_instance_state(&self, id: &str, role: InstanceRole, status: InstanceStatus);
}

/// Boundary to the credential collaborator
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve a credential reference to decrypted credentials.
    ///
    /// Returns None when the reference is unknown; callers fall back to
    /// development defaults for instances without a reference.
    async fn resolve(&self, credential_ref: &str) -> Option<Credentials>;
}

/// In-memory inventory, seeded from config
///
/// Backs the binary and the tests. A production deployment substitutes the
/// real inventory service behind the same trait.
pub struct MemoryInventory {
    /// instance id -> (cluster id, instance)
    instances: DashMap<String, (String, ManagedInstance)>,
    /// cluster id -> instance ids in registration order
    clusters: DashMap<String, Vec<String>>,
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            clusters: DashMap::new(),
        }
    }

    /// Build an inventory from the config's cluster seed list
    pub fn from_config(clusters: &[ClusterConfig], default_connect_timeout_ms: u64) -> Self {
        let inventory = Self::new();
        for cluster in clusters {
            for instance in &cluster.instances {
                inventory.register(
                    &cluster.id,
                    ManagedInstance {
                        id: instance.id.clone(),
                        host: instance.host.clone(),
                        port: instance.port,
                        credential_ref: instance.credential_ref.clone(),
                        database: instance.database.clone(),
                        ssl_mode: instance.ssl_mode,
                        max_connections: instance.max_connections,
                        connect_timeout_ms: instance
                            .connect_timeout_ms
                            .unwrap_or(default_connect_timeout_ms),
                        role: instance.role,
                        status: InstanceStatus::Healthy,
                    },
                );
            }
        }
        inventory
    }

    /// Register an instance under a cluster
    pub fn register(&self, cluster_id: &str, instance: ManagedInstance) {
        self.clusters
            .entry(cluster_id.to_string())
            .or_default()
            .push(instance.id.clone());
        self.instances
            .insert(instance.id.clone(), (cluster_id.to_string(), instance));
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn instance(&self, id: &str) -> Option<ManagedInstance> {
        self.instances.get(id).map(|e| e.value().1.clone())
    }

    async fn cluster_instances(&self, cluster_id: &str) -> Vec<ManagedInstance> {
        let Some(ids) = self.clusters.get(cluster_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.instances.get(id).map(|e| e.value().1.clone()))
            .collect()
    }

    async fn cluster_exists(&self, cluster_id: &str) -> bool {
        self.clusters.contains_key(cluster_id)
    }

    async fn set_instance_state(&self, id: &str, role: InstanceRole, status: InstanceStatus) {
        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.value_mut().1.role = role;
            entry.value_mut().1.status = status;
        }
    }
}

/// Credential store with a static table and development-default fallback
pub struct StaticCredentials {
    defaults: Credentials,
    entries: DashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new(defaults: Credentials) -> Self {
        Self {
            defaults,
            entries: DashMap::new(),
        }
    }

    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Register a named credential
    pub fn insert(&self, credential_ref: &str, credentials: Credentials) {
        self.entries.insert(credential_ref.to_string(), credentials);
    }

    /// The development-default credentials
    pub fn defaults(&self) -> Credentials {
        self.defaults.clone()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn resolve(&self, credential_ref: &str) -> Option<Credentials> {
        self.entries.get(credential_ref).map(|e| e.value().clone())
    }
}

/// Shared handles used throughout the crate
pub type SharedInventory = Arc<dyn Inventory>;
pub type SharedCredentials = Arc<dyn CredentialStore>;
