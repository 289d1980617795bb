//! Replication topology discovery and health classification
//!
//! Role detection, standby and slot listings, lag measurement, and a
//! severity rubric over those views. Everything is recomputed from live
//! catalog queries; nothing here caches.

pub mod health;
mod tracker;
mod types;

pub use health::{HealthLevel, ReplicationHealth};
pub use tracker::{ReplicationTracker, TopologyView};
pub use types::{
    ArchiverStats, ClusterTopology, InstanceTopology, RecoveryStatus, ReplicationLag,
    ReplicationSlotInfo, ReplicationStatus, StandbyStatus, WalReceiverStatus, WalStats,
};

use thiserror::Error;

use crate::pool::PoolError;

/// Error raised by topology and health views
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}
