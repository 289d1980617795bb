//! Failover orchestrator
//!
//! Initiation validates and creates the record synchronously, then hands
//! the step sequence to a worker task over a channel; the caller gets the
//! record id back immediately and polls the record for progress. A record
//! always leaves in-progress: any step failure closes it as failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{FailoverConfig, HealthBands};
use crate::inventory::{InstanceRole, InstanceStatus, SharedInventory};
use crate::metrics::metrics;
use crate::pool::{PoolError, PoolManager};
use crate::replication::TopologyView;

use super::readiness::FailoverReadinessScorer;
use super::record::{FailoverKind, FailoverRecord, FailoverStore, HistoryFilter};
use super::FailoverError;

const STEP_STOP_OLD_PRIMARY: &str = "stop_old_primary";
const STEP_PROMOTE_NEW_PRIMARY: &str = "promote_new_primary";
const STEP_UPDATE_INSTANCE_STATUS: &str = "update_instance_status";

/// Side-effectful primitives a failover runs against live servers
#[async_trait]
pub trait FailoverActions: Send + Sync {
    /// Terminate client backends so the instance stops accepting writes;
    /// returns the number of terminated backends
    async fn terminate_backends(&self, instance_id: &str) -> Result<u64, FailoverError>;

    /// Signal promotion out of recovery (does not wait)
    async fn promote(&self, instance_id: &str) -> Result<(), FailoverError>;

    /// Whether the instance is still replaying WAL
    async fn is_in_recovery(&self, instance_id: &str) -> Result<bool, FailoverError>;
}

/// Production actions over the pool manager
pub struct PgFailoverActions {
    pools: Arc<PoolManager>,
}

impl PgFailoverActions {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl FailoverActions for PgFailoverActions {
    async fn terminate_backends(&self, instance_id: &str) -> Result<u64, FailoverError> {
        let pool = self.pools.get_pool(instance_id).await?;
        let conn = pool.get().await?;
        let row = conn
            .client()
            .query_one(
                "SELECT count(*)::int8 FROM (SELECT pg_terminate_backend(pid) \
                 FROM pg_stat_activity \
                 WHERE pid <> pg_backend_pid() \
                 AND backend_type = 'client backend') AS terminated",
                &[],
            )
            .await
            .map_err(PoolError::from)?;
        let count: i64 = row.try_get(0).map_err(PoolError::from)?;
        Ok(count as u64)
    }

    async fn promote(&self, instance_id: &str) -> Result<(), FailoverError> {
        let pool = self.pools.get_pool(instance_id).await?;
        let conn = pool.get().await?;
        conn.client()
            .query_one("SELECT pg_promote(false)", &[])
            .await
            .map_err(PoolError::from)?;
        Ok(())
    }

    async fn is_in_recovery(&self, instance_id: &str) -> Result<bool, FailoverError> {
        let pool = self.pools.get_pool(instance_id).await?;
        let conn = pool.get().await?;
        let row = conn
            .client()
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .map_err(PoolError::from)?;
        Ok(row.try_get(0).map_err(PoolError::from)?)
    }
}

/// Failover initiation parameters
#[derive(Debug, Clone)]
pub struct FailoverRequest {
    pub cluster_id: String,
    pub new_primary_id: String,
    pub force: bool,
    pub reason: Option<String>,
}

/// Unit of work handed to the execution worker
struct FailoverJob {
    record_id: Uuid,
    kind: FailoverKind,
    new_primary_id: String,
    previous_primary_id: Option<String>,
    force: bool,
}

/// Shared state the worker executes against
#[derive(Clone)]
struct ExecContext {
    store: Arc<FailoverStore>,
    actions: Arc<dyn FailoverActions>,
    inventory: SharedInventory,
    config: FailoverConfig,
}

pub struct FailoverOrchestrator {
    inventory: SharedInventory,
    scorer: FailoverReadinessScorer,
    store: Arc<FailoverStore>,
    config: FailoverConfig,
    tx: mpsc::UnboundedSender<FailoverJob>,
    shutdown: CancellationToken,
    _worker: JoinHandle<()>,
}

impl FailoverOrchestrator {
    pub fn new(
        topology: Arc<dyn TopologyView>,
        inventory: SharedInventory,
        actions: Arc<dyn FailoverActions>,
        config: FailoverConfig,
        bands: HealthBands,
    ) -> Self {
        let store = Arc::new(FailoverStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let ctx = ExecContext {
            store: store.clone(),
            actions,
            inventory: inventory.clone(),
            config: config.clone(),
        };
        let worker = spawn_worker(ctx, rx, shutdown.clone());

        Self {
            inventory,
            scorer: FailoverReadinessScorer::new(topology, bands),
            store,
            config,
            tx,
            shutdown,
            _worker: worker,
        }
    }

    /// Validate and start a failover; returns the record id before the
    /// steps run
    pub async fn initiate_failover(
        &self,
        request: FailoverRequest,
    ) -> Result<Uuid, FailoverError> {
        if !self.inventory.cluster_exists(&request.cluster_id).await {
            return Err(FailoverError::UnknownCluster(request.cluster_id.clone()));
        }
        let members = self.inventory.cluster_instances(&request.cluster_id).await;
        if !members.iter().any(|m| m.id == request.new_primary_id) {
            return Err(FailoverError::UnknownInstance(format!(
                "{} (not a member of cluster {})",
                request.new_primary_id, request.cluster_id
            )));
        }
        let previous_primary_id = members
            .iter()
            .find(|m| m.is_primary() && m.id != request.new_primary_id)
            .map(|m| m.id.clone());

        if !request.force {
            let readiness = self
                .scorer
                .check_failover_readiness(&request.cluster_id)
                .await?;
            match readiness.candidate(&request.new_primary_id) {
                Some(candidate) if candidate.suitable => {}
                Some(candidate) => {
                    return Err(FailoverError::TargetNotSuitable(format!(
                        "{} scores {} (issues: {})",
                        request.new_primary_id,
                        candidate.score,
                        candidate.issues.join("; ")
                    )));
                }
                None => {
                    return Err(FailoverError::TargetNotSuitable(format!(
                        "{} is not a standby of cluster {}",
                        request.new_primary_id, request.cluster_id
                    )));
                }
            }
        }

        let record = self.store.begin(
            &request.cluster_id,
            previous_primary_id.clone(),
            &request.new_primary_id,
            FailoverKind::Manual,
            request.reason,
        )?;
        info!(
            record_id = %record.id,
            cluster_id = %request.cluster_id,
            new_primary = %request.new_primary_id,
            previous_primary = ?previous_primary_id,
            force = request.force,
            "Failover initiated"
        );

        let job = FailoverJob {
            record_id: record.id,
            kind: record.kind,
            new_primary_id: request.new_primary_id,
            previous_primary_id,
            force: request.force,
        };
        if self.tx.send(job).is_err() {
            self.store
                .fail(record.id, "orchestrator worker is not running");
        }
        Ok(record.id)
    }

    /// Planned variant: requires readiness, a suitable target, and lag
    /// within the switchover bound, all before any mutation
    pub async fn initiate_switchover(
        &self,
        cluster_id: &str,
        new_primary_id: &str,
    ) -> Result<Uuid, FailoverError> {
        let readiness = self.scorer.check_failover_readiness(cluster_id).await?;
        if !readiness.ready {
            return Err(FailoverError::NotReady(
                readiness
                    .reason
                    .unwrap_or_else(|| "cluster is not ready".to_string()),
            ));
        }
        let candidate = readiness.candidate(new_primary_id).ok_or_else(|| {
            FailoverError::TargetNotSuitable(format!(
                "{} is not a standby of cluster {}",
                new_primary_id, cluster_id
            ))
        })?;
        if !candidate.suitable {
            return Err(FailoverError::TargetNotSuitable(format!(
                "{} scores {} (issues: {})",
                new_primary_id,
                candidate.score,
                candidate.issues.join("; ")
            )));
        }
        match candidate.lag_seconds {
            Some(lag) if lag <= self.config.switchover_max_lag_secs => {}
            Some(lag) => {
                return Err(FailoverError::SwitchoverLagTooHigh {
                    instance_id: new_primary_id.to_string(),
                    lag_seconds: lag,
                    max_lag_secs: self.config.switchover_max_lag_secs,
                });
            }
            None => {
                return Err(FailoverError::LagUnavailable(new_primary_id.to_string()));
            }
        }

        self.initiate_failover(FailoverRequest {
            cluster_id: cluster_id.to_string(),
            new_primary_id: new_primary_id.to_string(),
            force: false,
            reason: Some("planned switchover".to_string()),
        })
        .await
    }

    /// Readiness verdict for a cluster
    pub async fn check_failover_readiness(
        &self,
        cluster_id: &str,
    ) -> Result<super::readiness::FailoverReadiness, FailoverError> {
        self.scorer.check_failover_readiness(cluster_id).await
    }

    /// Read one failover record
    pub fn get_failover(&self, id: Uuid) -> Option<FailoverRecord> {
        self.store.get(id)
    }

    /// Read failover history, newest first
    pub fn get_failover_history(&self, filter: &HistoryFilter) -> Vec<FailoverRecord> {
        self.store.history(filter)
    }

    /// Stop the execution worker; in-flight jobs finish, queued ones do not
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for FailoverOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_worker(
    ctx: ExecContext,
    mut rx: mpsc::UnboundedReceiver<FailoverJob>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    execute(&ctx, job).await;
                }
            }
        }
    })
}

async fn execute(ctx: &ExecContext, job: FailoverJob) {
    let kind = match job.kind {
        FailoverKind::Manual => "manual",
        FailoverKind::Automatic => "automatic",
    };
    match run_steps(ctx, &job).await {
        Ok(()) => {
            ctx.store.complete(job.record_id);
            metrics().record_failover(kind, "completed");
            info!(record_id = %job.record_id, new_primary = %job.new_primary_id, "Failover completed");
        }
        Err(e) => {
            ctx.store.fail(job.record_id, &e.to_string());
            metrics().record_failover(kind, "failed");
            warn!(record_id = %job.record_id, error = %e, "Failover failed");
        }
    }
}

async fn run_steps(ctx: &ExecContext, job: &FailoverJob) -> Result<(), FailoverError> {
    if let (Some(previous), false) = (&job.previous_primary_id, job.force) {
        ctx.store.start_step(job.record_id, STEP_STOP_OLD_PRIMARY);
        match ctx.actions.terminate_backends(previous).await {
            Ok(count) => {
                info!(record_id = %job.record_id, previous_primary = %previous, terminated = count, "Stopped old primary");
                ctx.store.complete_step(job.record_id);
            }
            Err(e) => {
                ctx.store.fail_step(job.record_id, &e.to_string());
                return Err(e);
            }
        }
    }

    ctx.store.start_step(job.record_id, STEP_PROMOTE_NEW_PRIMARY);
    if let Err(e) = ctx.actions.promote(&job.new_primary_id).await {
        ctx.store.fail_step(job.record_id, &e.to_string());
        return Err(e);
    }
    let mut promoted = false;
    for attempt in 1..=ctx.config.promote_poll_attempts {
        tokio::time::sleep(Duration::from_millis(ctx.config.promote_poll_interval_ms)).await;
        match ctx.actions.is_in_recovery(&job.new_primary_id).await {
            Ok(false) => {
                promoted = true;
                break;
            }
            Ok(true) => {}
            // A flaky poll is not fatal; the attempt budget bounds the wait
            Err(e) => warn!(record_id = %job.record_id, attempt, error = %e, "Promotion status check failed"),
        }
    }
    if !promoted {
        let e = FailoverError::PromotionTimeout {
            attempts: ctx.config.promote_poll_attempts,
        };
        ctx.store.fail_step(job.record_id, &e.to_string());
        return Err(e);
    }
    ctx.store.complete_step(job.record_id);

    ctx.store.start_step(job.record_id, STEP_UPDATE_INSTANCE_STATUS);
    ctx.inventory
        .set_instance_state(&job.new_primary_id, InstanceRole::Primary, InstanceStatus::Online)
        .await;
    if let Some(previous) = &job.previous_primary_id {
        ctx.inventory
            .set_instance_state(previous, InstanceRole::Standby, InstanceStatus::Degraded)
            .await;
    }
    ctx.store.complete_step(job.record_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::failover::record::{FailoverStatus, StepStatus};
    use crate::inventory::{
        InstanceStatus, Inventory, ManagedInstance, MemoryInventory, SslMode,
    };
    use crate::replication::{
        ClusterTopology, HealthLevel, InstanceTopology, ReplicationHealth, TopologyError,
    };

    struct MockTopology {
        topology: Mutex<ClusterTopology>,
        health: Mutex<HashMap<String, ReplicationHealth>>,
    }

    #[async_trait]
    impl TopologyView for MockTopology {
        async fn cluster_topology(&self, _: &str) -> Result<ClusterTopology, TopologyError> {
            Ok(self.topology.lock().clone())
        }

        async fn replication_health(
            &self,
            instance_id: &str,
        ) -> Result<ReplicationHealth, TopologyError> {
            Ok(self.health.lock().get(instance_id).cloned().unwrap_or(
                ReplicationHealth {
                    level: HealthLevel::Healthy,
                    issues: vec![],
                    warnings: vec![],
                },
            ))
        }
    }

    /// Promotes after `polls_until_promoted` recovery checks; u32::MAX
    /// never promotes. `hang_promote` parks the worker inside the promote
    /// call forever.
    struct MockActions {
        polls_until_promoted: u32,
        hang_promote: bool,
        polls: AtomicU32,
        terminate_calls: AtomicU32,
        promote_calls: AtomicU32,
    }

    impl MockActions {
        fn promoting_after(polls: u32) -> Self {
            Self {
                polls_until_promoted: polls,
                hang_promote: false,
                polls: AtomicU32::new(0),
                terminate_calls: AtomicU32::new(0),
                promote_calls: AtomicU32::new(0),
            }
        }

        fn hanging() -> Self {
            Self {
                hang_promote: true,
                ..Self::promoting_after(0)
            }
        }
    }

    #[async_trait]
    impl FailoverActions for MockActions {
        async fn terminate_backends(&self, _: &str) -> Result<u64, FailoverError> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn promote(&self, _: &str) -> Result<(), FailoverError> {
            if self.hang_promote {
                futures::future::pending::<()>().await;
            }
            self.promote_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_in_recovery(&self, _: &str) -> Result<bool, FailoverError> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(seen < self.polls_until_promoted.max(1))
        }
    }

    fn instance(id: &str, role: InstanceRole) -> ManagedInstance {
        ManagedInstance {
            id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 5432,
            credential_ref: None,
            database: "postgres".to_string(),
            ssl_mode: SslMode::Disable,
            max_connections: 4,
            connect_timeout_ms: 1000,
            role,
            status: InstanceStatus::Healthy,
        }
    }

    fn entry(id: &str, role: InstanceRole, lag: Option<f64>) -> InstanceTopology {
        InstanceTopology {
            instance_id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 5432,
            role,
            lag_seconds: lag,
            healthy: true,
            error: None,
        }
    }

    fn config() -> FailoverConfig {
        FailoverConfig {
            promote_poll_attempts: 30,
            promote_poll_interval_ms: 1000,
            switchover_max_lag_secs: 5.0,
        }
    }

    fn bands() -> HealthBands {
        HealthBands {
            warning_lag_secs: 60.0,
            critical_lag_secs: 300.0,
        }
    }

    fn fixture(standby_lag: f64, actions: MockActions) -> (FailoverOrchestrator, Arc<MemoryInventory>) {
        let inventory = Arc::new(MemoryInventory::new());
        inventory.register("c1", instance("a", InstanceRole::Primary));
        inventory.register("c1", instance("b", InstanceRole::Standby));

        let topology = Arc::new(MockTopology {
            topology: Mutex::new(ClusterTopology {
                cluster_id: "c1".to_string(),
                instances: vec![
                    entry("a", InstanceRole::Primary, None),
                    entry("b", InstanceRole::Standby, Some(standby_lag)),
                ],
            }),
            health: Mutex::new(HashMap::new()),
        });

        let orchestrator = FailoverOrchestrator::new(
            topology,
            inventory.clone(),
            Arc::new(actions),
            config(),
            bands(),
        );
        (orchestrator, inventory)
    }

    async fn wait_terminal(orchestrator: &FailoverOrchestrator, id: Uuid) -> FailoverRecord {
        loop {
            if let Some(record) = orchestrator.get_failover(id) {
                if record.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn request(force: bool) -> FailoverRequest {
        FailoverRequest {
            cluster_id: "c1".to_string(),
            new_primary_id: "b".to_string(),
            force,
            reason: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_failover_updates_roles() {
        let (orchestrator, inventory) = fixture(1.0, MockActions::promoting_after(2));

        let id = orchestrator.initiate_failover(request(false)).await.unwrap();
        let record = wait_terminal(&orchestrator, id).await;

        assert_eq!(record.status, FailoverStatus::Completed);
        let names: Vec<&str> = record.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["stop_old_primary", "promote_new_primary", "update_instance_status"]
        );
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(record.previous_primary_id.as_deref(), Some("a"));

        let new_primary = inventory.instance("b").await.unwrap();
        assert_eq!(new_primary.role, InstanceRole::Primary);
        assert_eq!(new_primary.status, InstanceStatus::Online);
        let old_primary = inventory.instance("a").await.unwrap();
        assert_eq!(old_primary.role, InstanceRole::Standby);
        assert_eq!(old_primary.status, InstanceStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_skips_stop_step() {
        let (orchestrator, _) = fixture(1.0, MockActions::promoting_after(1));

        let id = orchestrator.initiate_failover(request(true)).await.unwrap();
        let record = wait_terminal(&orchestrator, id).await;

        assert_eq!(record.status, FailoverStatus::Completed);
        assert_eq!(record.steps[0].name, "promote_new_primary");
        assert!(record.steps.iter().all(|s| s.name != "stop_old_primary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_initiation_rejected() {
        let (orchestrator, _) = fixture(1.0, MockActions::hanging());

        let first = orchestrator.initiate_failover(request(true)).await.unwrap();
        assert!(orchestrator.get_failover(first).is_some());

        match orchestrator.initiate_failover(request(true)).await {
            Err(FailoverError::AlreadyInProgress(cluster)) => assert_eq!(cluster, "c1"),
            other => panic!("expected AlreadyInProgress, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_timeout_fails_record() {
        let (orchestrator, _) = fixture(1.0, MockActions::promoting_after(u32::MAX));

        let id = orchestrator.initiate_failover(request(false)).await.unwrap();
        let record = wait_terminal(&orchestrator, id).await;

        assert_eq!(record.status, FailoverStatus::Failed);
        let promote = record
            .steps
            .iter()
            .find(|s| s.name == "promote_new_primary")
            .unwrap();
        assert_eq!(promote.status, StepStatus::Failed);
        assert!(promote.error.as_ref().unwrap().contains("recovery"));
        assert!(record.error_message.as_ref().unwrap().contains("30"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsuitable_target_rejected_without_force() {
        // Standby at 400s lag scores 60 and is still suitable; unhealthy
        // plus critical lag pushes below 50.
        let (orchestrator, _) = {
            let inventory = Arc::new(MemoryInventory::new());
            inventory.register("c1", instance("a", InstanceRole::Primary));
            inventory.register("c1", instance("b", InstanceRole::Standby));
            let mut unhealthy = entry("b", InstanceRole::Standby, Some(400.0));
            unhealthy.healthy = false;
            let topology = Arc::new(MockTopology {
                topology: Mutex::new(ClusterTopology {
                    cluster_id: "c1".to_string(),
                    instances: vec![entry("a", InstanceRole::Primary, None), unhealthy],
                }),
                health: Mutex::new(HashMap::new()),
            });
            (
                FailoverOrchestrator::new(
                    topology,
                    inventory.clone(),
                    Arc::new(MockActions::promoting_after(1)),
                    config(),
                    bands(),
                ),
                inventory,
            )
        };

        match orchestrator.initiate_failover(request(false)).await {
            Err(FailoverError::TargetNotSuitable(msg)) => assert!(msg.contains("b")),
            other => panic!("expected TargetNotSuitable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_switchover_lag_gate() {
        // 10s lag is fine for failover scoring but above the switchover bound
        let (orchestrator, _) = fixture(10.0, MockActions::promoting_after(1));

        match orchestrator.initiate_switchover("c1", "b").await {
            Err(FailoverError::SwitchoverLagTooHigh {
                instance_id,
                lag_seconds,
                ..
            }) => {
                assert_eq!(instance_id, "b");
                assert!((lag_seconds - 10.0).abs() < f64::EPSILON);
            }
            other => panic!("expected SwitchoverLagTooHigh, got {:?}", other),
        }
        assert!(orchestrator.get_failover_history(&HistoryFilter::default()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switchover_within_bound_completes() {
        let (orchestrator, _) = fixture(2.0, MockActions::promoting_after(1));

        let id = orchestrator.initiate_switchover("c1", "b").await.unwrap();
        let record = wait_terminal(&orchestrator, id).await;
        assert_eq!(record.status, FailoverStatus::Completed);
        assert_eq!(record.reason.as_deref(), Some("planned switchover"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_cluster_and_instance_rejected() {
        let (orchestrator, _) = fixture(1.0, MockActions::promoting_after(1));

        let missing_cluster = orchestrator
            .initiate_failover(FailoverRequest {
                cluster_id: "nope".to_string(),
                ..request(false)
            })
            .await;
        assert!(matches!(missing_cluster, Err(FailoverError::UnknownCluster(_))));

        let missing_instance = orchestrator
            .initiate_failover(FailoverRequest {
                new_primary_id: "zz".to_string(),
                ..request(false)
            })
            .await;
        assert!(matches!(missing_instance, Err(FailoverError::UnknownInstance(_))));
    }
}
