//! Typed rows for the replication catalog queries
//!
//! One explicit result type per catalog view, so field presence and the
//! text-vs-numeric LSN representations are fixed at compile time. All of
//! these are ephemeral: recomputed from live catalog queries on every call.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inventory::InstanceRole;

/// One row of `pg_stat_replication`, as seen from a primary
#[derive(Debug, Clone, Serialize)]
pub struct StandbyStatus {
    pub pid: i32,
    pub client_addr: Option<String>,
    pub application_name: String,
    pub state: Option<String>,
    pub sync_state: Option<String>,
    pub sent_lsn: Option<String>,
    pub write_lsn: Option<String>,
    pub flush_lsn: Option<String>,
    pub replay_lsn: Option<String>,
    pub write_lag_secs: Option<f64>,
    pub flush_lag_secs: Option<f64>,
    pub replay_lag_secs: Option<f64>,
}

impl StandbyStatus {
    /// Whether this standby participates in synchronous commit
    pub fn is_synchronous(&self) -> bool {
        matches!(self.sync_state.as_deref(), Some("sync") | Some("quorum"))
    }
}

/// One row of `pg_replication_slots`
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationSlotInfo {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub slot_type: String,
    pub active: bool,
    pub wal_status: Option<String>,
    pub restart_lsn: Option<String>,
    pub safe_wal_size: Option<i64>,
}

/// WAL position summary on a primary
#[derive(Debug, Clone, Serialize)]
pub struct WalStats {
    pub current_lsn: String,
    pub current_wal_file: String,
}

/// `pg_stat_archiver` summary
#[derive(Debug, Clone, Serialize)]
pub struct ArchiverStats {
    pub archived_count: i64,
    pub failed_count: i64,
    pub last_archived_wal: Option<String>,
    pub last_failed_wal: Option<String>,
}

/// `pg_stat_wal_receiver` summary on a standby (absent when not running)
#[derive(Debug, Clone, Serialize)]
pub struct WalReceiverStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub status: Option<String>,
    pub flushed_lsn: Option<String>,
    pub sender_host: Option<String>,
    pub sender_port: Option<i32>,
}

impl WalReceiverStatus {
    pub fn not_running() -> Self {
        Self {
            running: false,
            pid: None,
            status: None,
            flushed_lsn: None,
            sender_host: None,
            sender_port: None,
        }
    }
}

/// Recovery state on a standby
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub in_recovery: bool,
    pub replay_paused: bool,
    pub last_replay_lsn: Option<String>,
    pub last_replay_timestamp: Option<DateTime<Utc>>,
}

/// Replication lag of a standby relative to its upstream
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReplicationLag {
    /// Bytes between last-received and last-replayed WAL
    pub lag_bytes: i64,
    /// Seconds since the last replayed transaction; None when the standby
    /// has not replayed anything yet (or on a primary)
    pub lag_seconds: Option<f64>,
}

impl ReplicationLag {
    /// Lag as reported for a primary: not applicable, never an error
    pub fn not_applicable() -> Self {
        Self {
            lag_bytes: 0,
            lag_seconds: None,
        }
    }
}

/// Role-branched view of one instance's replication state
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ReplicationStatus {
    Primary {
        standbys: Vec<StandbyStatus>,
        slots: Vec<ReplicationSlotInfo>,
        wal: WalStats,
        archiver: ArchiverStats,
    },
    Standby {
        receiver: WalReceiverStatus,
        recovery: RecoveryStatus,
        lag: ReplicationLag,
    },
}

impl ReplicationStatus {
    pub fn role(&self) -> InstanceRole {
        match self {
            ReplicationStatus::Primary { .. } => InstanceRole::Primary,
            ReplicationStatus::Standby { .. } => InstanceRole::Standby,
        }
    }
}

/// One instance's entry in a cluster topology view
#[derive(Debug, Clone, Serialize)]
pub struct InstanceTopology {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub role: InstanceRole,
    pub lag_seconds: Option<f64>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fresh per-request view of a whole cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopology {
    pub cluster_id: String,
    pub instances: Vec<InstanceTopology>,
}

impl ClusterTopology {
    /// The resolved primary, when exactly classifiable
    pub fn primary(&self) -> Option<&InstanceTopology> {
        self.instances.iter().find(|i| i.role == InstanceRole::Primary)
    }

    /// All instances classified as standbys, in inventory order
    pub fn standbys(&self) -> Vec<&InstanceTopology> {
        self.instances
            .iter()
            .filter(|i| i.role == InstanceRole::Standby)
            .collect()
    }
}
