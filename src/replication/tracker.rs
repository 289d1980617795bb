//! Replication topology tracker
//!
//! Every view here is computed from live catalog queries at call time.
//! Cluster-wide views fan out concurrently and isolate per-instance
//! failures: one unreachable server degrades its own entry, never the
//! aggregate call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::HealthBands;
use crate::inventory::{InstanceRole, InstanceStatus, ManagedInstance, SharedInventory};
use crate::metrics::metrics;
use crate::pool::{PoolManager, PooledConn};

use super::health::{classify, ReplicationHealth};
use super::types::{
    ArchiverStats, ClusterTopology, InstanceTopology, RecoveryStatus, ReplicationLag,
    ReplicationSlotInfo, ReplicationStatus, StandbyStatus, WalReceiverStatus, WalStats,
};
use super::TopologyError;

const STANDBY_STATUS_SQL: &str = "SELECT pid, client_addr::text, application_name, state, \
     sync_state, sent_lsn::text, write_lsn::text, flush_lsn::text, replay_lsn::text, \
     EXTRACT(EPOCH FROM write_lag)::float8, EXTRACT(EPOCH FROM flush_lag)::float8, \
     EXTRACT(EPOCH FROM replay_lag)::float8 \
     FROM pg_stat_replication ORDER BY application_name, pid";

const SLOTS_SQL: &str = "SELECT slot_name, plugin, slot_type, active, wal_status, \
     restart_lsn::text, safe_wal_size \
     FROM pg_replication_slots ORDER BY slot_name";

const WAL_STATS_SQL: &str =
    "SELECT pg_current_wal_lsn()::text, pg_walfile_name(pg_current_wal_lsn())";

const ARCHIVER_SQL: &str = "SELECT archived_count, failed_count, last_archived_wal, \
     last_failed_wal FROM pg_stat_archiver";

const WAL_RECEIVER_SQL: &str = "SELECT pid, status, flushed_lsn::text, sender_host, \
     sender_port FROM pg_stat_wal_receiver";

const RECOVERY_SQL: &str = "SELECT pg_is_wal_replay_paused(), \
     pg_last_wal_replay_lsn()::text, pg_last_xact_replay_timestamp()";

const LAG_SQL: &str = "SELECT COALESCE(pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
     pg_last_wal_replay_lsn()), 0)::int8, \
     EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8";

/// Read seam consumed by the failover layers
#[async_trait]
pub trait TopologyView: Send + Sync {
    /// Fresh cluster topology (fan-out with partial-failure isolation)
    async fn cluster_topology(&self, cluster_id: &str) -> Result<ClusterTopology, TopologyError>;

    /// Fresh replication health classification for one instance
    async fn replication_health(
        &self,
        instance_id: &str,
    ) -> Result<ReplicationHealth, TopologyError>;
}

pub struct ReplicationTracker {
    pools: Arc<PoolManager>,
    inventory: SharedInventory,
    bands: HealthBands,
}

impl ReplicationTracker {
    pub fn new(pools: Arc<PoolManager>, inventory: SharedInventory, bands: HealthBands) -> Self {
        Self {
            pools,
            inventory,
            bands,
        }
    }

    async fn checkout(&self, instance_id: &str) -> Result<PooledConn, TopologyError> {
        let pool = self.pools.get_pool(instance_id).await?;
        Ok(pool.get().await?)
    }

    /// Role-branched replication view of one instance
    pub async fn get_replication_status(
        &self,
        instance_id: &str,
    ) -> Result<ReplicationStatus, TopologyError> {
        let conn = self.checkout(instance_id).await?;

        if Self::in_recovery(&conn).await? {
            let receiver = Self::wal_receiver(&conn).await?;
            let recovery = Self::recovery_status(&conn).await?;
            let lag = Self::standby_lag(&conn).await?;
            Ok(ReplicationStatus::Standby {
                receiver,
                recovery,
                lag,
            })
        } else {
            let standbys = Self::standby_rows(&conn).await?;
            let slots = Self::slot_rows(&conn).await?;
            let wal = Self::wal_stats(&conn).await?;
            let archiver = Self::archiver_stats(&conn).await?;
            Ok(ReplicationStatus::Primary {
                standbys,
                slots,
                wal,
                archiver,
            })
        }
    }

    /// Lag of one instance; on a primary this is "not applicable", never an error
    pub async fn calculate_replication_lag(
        &self,
        instance_id: &str,
    ) -> Result<ReplicationLag, TopologyError> {
        let conn = self.checkout(instance_id).await?;
        if Self::in_recovery(&conn).await? {
            Self::standby_lag(&conn).await
        } else {
            Ok(ReplicationLag::not_applicable())
        }
    }

    /// Fresh whole-cluster view
    ///
    /// Probes every instance concurrently. A failed probe degrades that one
    /// entry (role Unknown, healthy=false, error set); resolved roles are
    /// written back to the inventory when they changed.
    pub async fn get_cluster_topology(
        &self,
        cluster_id: &str,
    ) -> Result<ClusterTopology, TopologyError> {
        if !self.inventory.cluster_exists(cluster_id).await {
            return Err(TopologyError::UnknownCluster(cluster_id.to_string()));
        }
        let members = self.inventory.cluster_instances(cluster_id).await;

        let probes = members.iter().map(|instance| self.probe_instance(instance));
        let instances: Vec<InstanceTopology> = join_all(probes).await;

        let degraded = instances.iter().filter(|i| i.error.is_some()).count();
        metrics().record_topology_refresh(if degraded == 0 { "ok" } else { "partial" });
        if degraded > 0 {
            warn!(cluster_id, degraded, total = instances.len(), "Topology probe partially failed");
        }

        Ok(ClusterTopology {
            cluster_id: cluster_id.to_string(),
            instances,
        })
    }

    async fn probe_instance(&self, instance: &ManagedInstance) -> InstanceTopology {
        let probed = async {
            let conn = self.checkout(&instance.id).await?;
            let role = if Self::in_recovery(&conn).await? {
                InstanceRole::Standby
            } else {
                InstanceRole::Primary
            };
            let lag = match role {
                InstanceRole::Standby => Self::standby_lag(&conn).await?,
                _ => ReplicationLag::not_applicable(),
            };
            Ok::<(InstanceRole, ReplicationLag), TopologyError>((role, lag))
        }
        .await;

        match probed {
            Ok((role, lag)) => {
                if role != instance.role {
                    debug!(
                        instance_id = %instance.id,
                        previous = ?instance.role,
                        resolved = ?role,
                        "Instance role changed"
                    );
                    self.inventory
                        .set_instance_state(&instance.id, role, instance.status)
                        .await;
                }
                InstanceTopology {
                    instance_id: instance.id.clone(),
                    host: instance.host.clone(),
                    port: instance.port,
                    role,
                    lag_seconds: lag.lag_seconds,
                    healthy: instance.status == InstanceStatus::Healthy,
                    error: None,
                }
            }
            Err(e) => InstanceTopology {
                instance_id: instance.id.clone(),
                host: instance.host.clone(),
                port: instance.port,
                role: InstanceRole::Unknown,
                lag_seconds: None,
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Health classification for one instance per the severity rubric
    pub async fn check_replication_health(
        &self,
        instance_id: &str,
    ) -> Result<ReplicationHealth, TopologyError> {
        let status = self.get_replication_status(instance_id).await?;
        Ok(classify(&status, &self.bands))
    }

    /// Attached standbys as reported by a primary's `pg_stat_replication`
    pub async fn get_standby_list(
        &self,
        instance_id: &str,
    ) -> Result<Vec<StandbyStatus>, TopologyError> {
        let conn = self.checkout(instance_id).await?;
        Self::standby_rows(&conn).await
    }

    /// Replication slots held by an instance
    pub async fn get_replication_slots(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ReplicationSlotInfo>, TopologyError> {
        let conn = self.checkout(instance_id).await?;
        Self::slot_rows(&conn).await
    }

    async fn in_recovery(conn: &PooledConn) -> Result<bool, TopologyError> {
        let row = conn.client().query_one("SELECT pg_is_in_recovery()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn standby_rows(conn: &PooledConn) -> Result<Vec<StandbyStatus>, TopologyError> {
        let rows = conn.client().query(STANDBY_STATUS_SQL, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(StandbyStatus {
                    pid: row.try_get(0)?,
                    client_addr: row.try_get(1)?,
                    application_name: row.try_get(2)?,
                    state: row.try_get(3)?,
                    sync_state: row.try_get(4)?,
                    sent_lsn: row.try_get(5)?,
                    write_lsn: row.try_get(6)?,
                    flush_lsn: row.try_get(7)?,
                    replay_lsn: row.try_get(8)?,
                    write_lag_secs: row.try_get(9)?,
                    flush_lag_secs: row.try_get(10)?,
                    replay_lag_secs: row.try_get(11)?,
                })
            })
            .collect()
    }

    async fn slot_rows(conn: &PooledConn) -> Result<Vec<ReplicationSlotInfo>, TopologyError> {
        let rows = conn.client().query(SLOTS_SQL, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(ReplicationSlotInfo {
                    slot_name: row.try_get(0)?,
                    plugin: row.try_get(1)?,
                    slot_type: row.try_get(2)?,
                    active: row.try_get(3)?,
                    wal_status: row.try_get(4)?,
                    restart_lsn: row.try_get(5)?,
                    safe_wal_size: row.try_get(6)?,
                })
            })
            .collect()
    }

    async fn wal_stats(conn: &PooledConn) -> Result<WalStats, TopologyError> {
        let row = conn.client().query_one(WAL_STATS_SQL, &[]).await?;
        Ok(WalStats {
            current_lsn: row.try_get(0)?,
            current_wal_file: row.try_get(1)?,
        })
    }

    async fn archiver_stats(conn: &PooledConn) -> Result<ArchiverStats, TopologyError> {
        let row = conn.client().query_one(ARCHIVER_SQL, &[]).await?;
        Ok(ArchiverStats {
            archived_count: row.try_get(0)?,
            failed_count: row.try_get(1)?,
            last_archived_wal: row.try_get(2)?,
            last_failed_wal: row.try_get(3)?,
        })
    }

    async fn wal_receiver(conn: &PooledConn) -> Result<WalReceiverStatus, TopologyError> {
        let row = conn.client().query_opt(WAL_RECEIVER_SQL, &[]).await?;
        Ok(match row {
            Some(row) => WalReceiverStatus {
                running: true,
                pid: row.try_get(0)?,
                status: row.try_get(1)?,
                flushed_lsn: row.try_get(2)?,
                sender_host: row.try_get(3)?,
                sender_port: row.try_get(4)?,
            },
            None => WalReceiverStatus::not_running(),
        })
    }

    async fn recovery_status(conn: &PooledConn) -> Result<RecoveryStatus, TopologyError> {
        let row = conn.client().query_one(RECOVERY_SQL, &[]).await?;
        Ok(RecoveryStatus {
            in_recovery: true,
            replay_paused: row.try_get(0)?,
            last_replay_lsn: row.try_get(1)?,
            last_replay_timestamp: row.try_get(2)?,
        })
    }

    async fn standby_lag(conn: &PooledConn) -> Result<ReplicationLag, TopologyError> {
        let row = conn.client().query_one(LAG_SQL, &[]).await?;
        Ok(ReplicationLag {
            lag_bytes: row.try_get(0)?,
            lag_seconds: row.try_get(1)?,
        })
    }
}

#[async_trait]
impl TopologyView for ReplicationTracker {
    async fn cluster_topology(&self, cluster_id: &str) -> Result<ClusterTopology, TopologyError> {
        self.get_cluster_topology(cluster_id).await
    }

    async fn replication_health(
        &self,
        instance_id: &str,
    ) -> Result<ReplicationHealth, TopologyError> {
        self.check_replication_health(instance_id).await
    }
}
