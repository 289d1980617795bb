//! Failover readiness scoring and orchestration
//!
//! The scorer grades every standby of a cluster as a promotion candidate.
//! The orchestrator executes failover and switchover as tracked, ordered
//! step sequences against live servers, recorded in an append-only store
//! that callers poll for progress.

mod orchestrator;
mod readiness;
mod record;

pub use orchestrator::{
    FailoverActions, FailoverOrchestrator, FailoverRequest, PgFailoverActions,
};
pub use readiness::{FailoverCandidate, FailoverReadiness, FailoverReadinessScorer};
pub use record::{
    FailoverKind, FailoverRecord, FailoverStatus, FailoverStep, FailoverStore, HistoryFilter,
    StepStatus,
};

use thiserror::Error;

use crate::pool::PoolError;
use crate::replication::TopologyError;

/// Error raised by failover validation and execution
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),
    #[error("A failover is already in progress for cluster {0}")]
    AlreadyInProgress(String),
    #[error("Target instance is not suitable: {0}")]
    TargetNotSuitable(String),
    #[error("Cluster is not ready for failover: {0}")]
    NotReady(String),
    #[error("Switchover requires lag <= {max_lag_secs}s, but {instance_id} lags {lag_seconds:.1}s")]
    SwitchoverLagTooHigh {
        instance_id: String,
        lag_seconds: f64,
        max_lag_secs: f64,
    },
    #[error("Replication lag for {0} is unknown; switchover requires a measured lag")]
    LagUnavailable(String),
    #[error("Instance still in recovery after {attempts} promotion checks")]
    PromotionTimeout { attempts: u32 },
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}
