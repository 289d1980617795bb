//! Failover readiness scoring
//!
//! Grades every standby of a cluster 0..=100 as a promotion candidate.
//! The score and the replication health classification are independent
//! signals graded on their own bands; both are surfaced to the caller and
//! never collapsed into one number.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::config::HealthBands;
use crate::replication::TopologyView;

use super::FailoverError;

const UNHEALTHY_DEDUCTION: i32 = 50;
const LAG_CRITICAL_DEDUCTION: i32 = 40;
const LAG_WARNING_DEDUCTION: i32 = 20;
const HEALTH_CRITICAL_DEDUCTION: i32 = 30;
const HEALTH_WARNING_DEDUCTION: i32 = 10;
const SUITABLE_THRESHOLD: u32 = 50;

/// One standby graded as a promotion candidate
#[derive(Debug, Clone, Serialize)]
pub struct FailoverCandidate {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub score: u32,
    pub suitable: bool,
    pub lag_seconds: Option<f64>,
    pub issues: Vec<String>,
}

/// Readiness verdict for a whole cluster
#[derive(Debug, Clone, Serialize)]
pub struct FailoverReadiness {
    pub cluster_id: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub primary_id: Option<String>,
    pub candidates: Vec<FailoverCandidate>,
    /// Highest-scoring candidate; ties break by standby order (stable)
    pub best_candidate: Option<String>,
}

impl FailoverReadiness {
    fn not_ready(cluster_id: &str, reason: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            ready: false,
            reason: Some(reason.to_string()),
            primary_id: None,
            candidates: Vec::new(),
            best_candidate: None,
        }
    }

    pub fn candidate(&self, instance_id: &str) -> Option<&FailoverCandidate> {
        self.candidates.iter().find(|c| c.instance_id == instance_id)
    }
}

pub struct FailoverReadinessScorer {
    topology: Arc<dyn TopologyView>,
    bands: HealthBands,
}

impl FailoverReadinessScorer {
    pub fn new(topology: Arc<dyn TopologyView>, bands: HealthBands) -> Self {
        Self { topology, bands }
    }

    /// Grade every standby of a cluster and pick the best candidate
    ///
    /// Requires a resolved primary and at least one standby; otherwise the
    /// verdict is not-ready with a reason and no candidates.
    pub async fn check_failover_readiness(
        &self,
        cluster_id: &str,
    ) -> Result<FailoverReadiness, FailoverError> {
        let topology = self.topology.cluster_topology(cluster_id).await?;

        let Some(primary) = topology.primary() else {
            return Ok(FailoverReadiness::not_ready(
                cluster_id,
                "no resolved primary in cluster",
            ));
        };
        let primary_id = primary.instance_id.clone();

        let standbys = topology.standbys();
        if standbys.is_empty() {
            return Ok(FailoverReadiness::not_ready(
                cluster_id,
                "cluster has no standbys to promote",
            ));
        }

        // One slow standby must not delay grading the others
        let health_probes = standbys
            .iter()
            .map(|s| self.topology.replication_health(&s.instance_id));
        let healths = join_all(health_probes).await;

        let mut candidates = Vec::with_capacity(standbys.len());
        for (standby, health) in standbys.iter().zip(healths) {
            let mut score: i32 = 100;
            let mut issues = Vec::new();

            if !standby.healthy {
                score -= UNHEALTHY_DEDUCTION;
                issues.push("instance is unhealthy".to_string());
            }

            let lag_deducted = match standby.lag_seconds {
                Some(lag) if lag > self.bands.critical_lag_secs => {
                    score -= LAG_CRITICAL_DEDUCTION;
                    issues.push(format!(
                        "replication lag {:.1}s exceeds {:.0}s",
                        lag, self.bands.critical_lag_secs
                    ));
                    true
                }
                Some(lag) if lag >= self.bands.warning_lag_secs => {
                    score -= LAG_WARNING_DEDUCTION;
                    issues.push(format!(
                        "replication lag {:.1}s exceeds {:.0}s",
                        lag, self.bands.warning_lag_secs
                    ));
                    true
                }
                Some(_) => false,
                None => {
                    issues.push("replication lag is unknown".to_string());
                    false
                }
            };

            // Health conditions always surface on the candidate; only the
            // deduction stays out when a lag band already deducted, since
            // the two rubrics overlap on the lag signal.
            match health {
                Ok(health) if health.is_critical() => {
                    if !lag_deducted {
                        score -= HEALTH_CRITICAL_DEDUCTION;
                    }
                    issues.extend(health.issues);
                }
                Ok(health) if health.is_warning() => {
                    if !lag_deducted {
                        score -= HEALTH_WARNING_DEDUCTION;
                    }
                    issues.extend(health.warnings);
                }
                Ok(_) => {}
                Err(e) => {
                    issues.push(format!("health probe failed: {}", e));
                }
            }

            let score = score.max(0) as u32;
            candidates.push(FailoverCandidate {
                instance_id: standby.instance_id.clone(),
                host: standby.host.clone(),
                port: standby.port,
                score,
                suitable: score >= SUITABLE_THRESHOLD,
                lag_seconds: standby.lag_seconds,
                issues,
            });
        }

        // First-highest wins ties (max_by_key would keep the last)
        let best_candidate = candidates
            .iter()
            .fold(None::<&FailoverCandidate>, |best, c| match best {
                Some(b) if b.score >= c.score => Some(b),
                _ => Some(c),
            })
            .map(|c| c.instance_id.clone());
        let ready = candidates.iter().any(|c| c.suitable);
        let reason = if ready {
            None
        } else {
            Some("no standby scores as a suitable promotion candidate".to_string())
        };
        debug!(cluster_id, ready, candidates = candidates.len(), "Scored failover readiness");

        Ok(FailoverReadiness {
            cluster_id: cluster_id.to_string(),
            ready,
            reason,
            primary_id: Some(primary_id),
            candidates,
            best_candidate,
        })
    }
}
