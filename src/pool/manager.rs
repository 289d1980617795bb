//! Pool manager: the per-instance pool registry
//!
//! Owns exactly one live pool per managed instance. Pools are created lazily
//! on first access (creation does not dial; connections are dialed on first
//! checkout), tracked by last use, and evicted by a fixed cleanup timer when
//! unused for longer than the idle-pool timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::inventory::{Credentials, SharedCredentials, SharedInventory};
use crate::metrics::metrics;

use super::connection::{instance_config, params_config, ConnectParams, PgConn};
use super::instance::{InstancePool, PooledConn};
use super::query::{self, FieldDescription};
use super::PoolError;

/// One registry entry: the pool plus its usage bookkeeping
struct PoolEntry {
    pool: Arc<InstancePool>,
    created_at: Instant,
    last_used_at: parking_lot::Mutex<Instant>,
}

impl PoolEntry {
    fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used_at.lock().elapsed()
    }
}

/// Options for a single query execution
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Statement timeout scoped to the borrowed connection
    pub timeout: Option<Duration>,
    /// Append a LIMIT to row-returning statements that lack one
    pub row_limit: Option<u32>,
    /// Run EXPLAIN (FORMAT JSON, ANALYZE) first for row-returning statements
    pub include_explain: bool,
}

/// Result of a query execution
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<JsonValue>,
    pub row_count: u64,
    pub fields: Vec<FieldDescription>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain_plan: Option<JsonValue>,
}

/// Result of a connection probe (never an error)
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub latency_ms: u64,
}

/// Aggregate pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolManagerStats {
    pub pools: usize,
    pub total_idle: usize,
    pub total_in_use: usize,
}

pub struct PoolManager {
    pools: DashMap<String, Arc<PoolEntry>>,
    inventory: SharedInventory,
    credentials: SharedCredentials,
    fallback: Credentials,
    settings: PoolConfig,
}

impl PoolManager {
    pub fn new(
        inventory: SharedInventory,
        credentials: SharedCredentials,
        fallback: Credentials,
        settings: PoolConfig,
    ) -> Self {
        Self {
            pools: DashMap::new(),
            inventory,
            credentials,
            fallback,
            settings,
        }
    }

    /// Get the live pool for an instance, creating it on first access
    ///
    /// Updates the entry's last-used timestamp on every call.
    pub async fn get_pool(&self, instance_id: &str) -> Result<Arc<InstancePool>, PoolError> {
        if let Some(entry) = self.pools.get(instance_id) {
            entry.touch();
            return Ok(entry.pool.clone());
        }

        let instance = self
            .inventory
            .instance(instance_id)
            .await
            .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))?;

        let credentials = match &instance.credential_ref {
            Some(reference) => self.credentials.resolve(reference).await.ok_or_else(|| {
                PoolError::Credential(format!(
                    "no credentials for reference '{}' (instance {})",
                    reference, instance_id
                ))
            })?,
            None => self.fallback.clone(),
        };

        let config = instance_config(&instance, &credentials);
        let pool = Arc::new(InstancePool::new(
            config,
            &self.settings,
            instance.max_connections,
            Duration::from_millis(instance.connect_timeout_ms),
        ));
        let entry = Arc::new(PoolEntry {
            pool,
            created_at: Instant::now(),
            last_used_at: parking_lot::Mutex::new(Instant::now()),
        });

        // Keep at most one live pool per instance under concurrent creation
        let entry = self
            .pools
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                info!(instance_id, addr = %instance.addr(), "Created connection pool");
                metrics().record_pool_created();
                entry
            })
            .clone();
        entry.touch();
        Ok(entry.pool.clone())
    }

    /// Execute a statement on an instance's pool
    ///
    /// The borrowed connection is released on every exit path. A statement
    /// timeout, when given, is set on the borrowed connection and reset
    /// before release so it cannot leak onto another borrower's query.
    pub async fn execute_query(
        &self,
        instance_id: &str,
        sql: &str,
        params: &[JsonValue],
        opts: QueryOptions,
    ) -> Result<QueryOutcome, PoolError> {
        let pool = self.get_pool(instance_id).await?;
        let mut conn = pool.get().await?;
        let started = Instant::now();

        if let Some(timeout) = opts.timeout {
            let ms = timeout.as_millis().max(1);
            if let Err(e) = conn
                .client()
                .batch_execute(&format!("SET statement_timeout = {}", ms))
                .await
            {
                conn.mark_broken();
                return Err(e.into());
            }
        }

        let result = Self::run_statement(&conn, sql, params, &opts).await;

        if opts.timeout.is_some()
            && conn
                .client()
                .batch_execute("RESET statement_timeout")
                .await
                .is_err()
        {
            // Could not prove the timeout is gone; do not reuse this connection
            conn.mark_broken();
        }

        match result {
            Ok(mut outcome) => {
                outcome.execution_time_ms = started.elapsed().as_millis() as u64;
                metrics().record_query("ok", started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(e) => {
                metrics().record_query_error("execute");
                Err(e)
            }
        }
    }

    async fn run_statement(
        conn: &PooledConn,
        sql: &str,
        params: &[JsonValue],
        opts: &QueryOptions,
    ) -> Result<QueryOutcome, PoolError> {
        let info = query::analyze(sql);
        let boxed = query::json_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if !info.row_returning {
            let affected = conn.client().execute(sql, &refs).await?;
            return Ok(QueryOutcome {
                rows: Vec::new(),
                row_count: affected,
                fields: Vec::new(),
                execution_time_ms: 0,
                explain_plan: None,
            });
        }

        let explain_plan = if opts.include_explain {
            let explain_sql = format!("EXPLAIN (FORMAT JSON, ANALYZE) {}", sql);
            let rows = conn.client().query(&explain_sql, &refs).await?;
            rows.first().and_then(|row| {
                row.try_get::<_, JsonValue>(0).ok().or_else(|| {
                    row.try_get::<_, String>(0)
                        .ok()
                        .and_then(|s| serde_json::from_str(&s).ok())
                })
            })
        } else {
            None
        };

        let effective = match opts.row_limit {
            Some(limit) if !info.has_limit => query::apply_row_limit(sql, limit),
            _ => sql.to_string(),
        };

        let statement = conn.client().prepare(&effective).await?;
        let rows = conn.client().query(&statement, &refs).await?;
        let fields = statement
            .columns()
            .iter()
            .map(|c| FieldDescription {
                name: c.name().to_string(),
                type_name: c.type_().name().to_string(),
            })
            .collect();

        Ok(QueryOutcome {
            row_count: rows.len() as u64,
            rows: rows.iter().map(query::row_to_json).collect(),
            fields,
            execution_time_ms: 0,
            explain_plan,
        })
    }

    /// Probe connectivity to a managed instance; captures failures, never errors
    pub async fn test_connection(&self, instance_id: &str) -> ConnectionCheck {
        let started = Instant::now();
        let result = async {
            let pool = self.get_pool(instance_id).await?;
            let conn = pool.get().await?;
            let row = conn.client().query_one("SELECT version()", &[]).await?;
            let version: String = row.try_get(0)?;
            Ok::<String, PoolError>(version)
        }
        .await;
        Self::check_outcome(result, started)
    }

    /// Probe connectivity with ad-hoc parameters, bypassing the registry
    pub async fn test_connection_with_params(&self, params: &ConnectParams) -> ConnectionCheck {
        let started = Instant::now();
        let result = async {
            let config = params_config(params);
            let conn = PgConn::connect(
                &config,
                Duration::from_millis(params.connect_timeout_ms),
            )
            .await?;
            let row = conn.client().query_one("SELECT version()", &[]).await?;
            let version: String = row.try_get(0)?;
            Ok::<String, PoolError>(version)
        }
        .await;
        Self::check_outcome(result, started)
    }

    fn check_outcome(result: Result<String, PoolError>, started: Instant) -> ConnectionCheck {
        let latency_ms = started.elapsed().as_millis() as u64;
        metrics().record_probe(result.is_ok());
        match result {
            Ok(version) => ConnectionCheck {
                success: true,
                message: "connection ok".to_string(),
                version: Some(version),
                latency_ms,
            },
            Err(e) => ConnectionCheck {
                success: false,
                message: e.to_string(),
                version: None,
                latency_ms,
            },
        }
    }

    /// Drain and remove an instance's pool; no-op when absent
    pub async fn close_pool(&self, instance_id: &str) {
        if let Some((_, entry)) = self.pools.remove(instance_id) {
            entry.pool.close().await;
            metrics().record_pool_closed();
            info!(instance_id, "Closed connection pool");
        }
    }

    /// Close and recreate an instance's pool (after credential/host/SSL changes)
    pub async fn refresh_pool(&self, instance_id: &str) -> Result<Arc<InstancePool>, PoolError> {
        self.close_pool(instance_id).await;
        self.get_pool(instance_id).await
    }

    /// Evict pools unused longer than the idle-pool timeout
    ///
    /// Eviction drains the pool first, so an in-flight query is never severed.
    pub async fn cleanup_idle_pools(&self) -> usize {
        let timeout = Duration::from_secs(self.settings.idle_pool_timeout_secs);
        let stale: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for instance_id in stale {
            if let Some((_, entry)) = self.pools.remove(&instance_id) {
                debug!(
                    instance_id,
                    age_secs = entry.created_at.elapsed().as_secs(),
                    "Evicting idle pool"
                );
                entry.pool.close().await;
                metrics().record_pool_evicted();
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "Idle pool cleanup finished");
        }
        evicted
    }

    /// Spawn the fixed-interval idle-pool eviction task
    pub fn spawn_cleanup_task(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would evict nothing; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Idle-pool cleanup task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.cleanup_idle_pools().await;
                    }
                }
            }
        })
    }

    /// Drain every pool (process shutdown)
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for instance_id in ids {
            self.close_pool(&instance_id).await;
        }
    }

    /// Aggregate statistics over all pools
    pub async fn stats(&self) -> PoolManagerStats {
        let entries: Vec<Arc<PoolEntry>> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut total_idle = 0;
        let mut total_in_use = 0;
        for entry in &entries {
            total_idle += entry.pool.idle_count().await;
            total_in_use += entry.pool.in_use();
        }
        PoolManagerStats {
            pools: entries.len(),
            total_idle,
            total_in_use,
        }
    }

    /// When the entry exists, how long since it was last used
    pub fn pool_idle_for(&self, instance_id: &str) -> Option<Duration> {
        self.pools.get(instance_id).map(|e| e.idle_for())
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            warn!(pools = self.pools.len(), "Pool manager dropped with live pools");
        }
    }
}
