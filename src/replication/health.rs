//! Replication health rubric
//!
//! Pure classification over a role-branched replication status. Critical
//! conditions dominate warnings; a clean view is healthy. This rubric is an
//! independent signal from failover readiness scoring, which applies its own
//! bands to the same inputs.

use serde::Serialize;

use crate::config::HealthBands;

use super::types::ReplicationStatus;

/// Overall severity of an instance's replication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Classified replication health with the conditions that produced it
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationHealth {
    pub level: HealthLevel,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl ReplicationHealth {
    pub fn is_critical(&self) -> bool {
        self.level == HealthLevel::Critical
    }

    pub fn is_warning(&self) -> bool {
        self.level == HealthLevel::Warning
    }
}

/// Derive health from a replication status view
pub fn classify(status: &ReplicationStatus, bands: &HealthBands) -> ReplicationHealth {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    match status {
        ReplicationStatus::Primary {
            standbys,
            slots,
            archiver,
            ..
        } => {
            if standbys.is_empty() {
                warnings.push("no standbys attached to this primary".to_string());
            } else if !standbys.iter().any(|s| s.is_synchronous()) {
                warnings.push("no synchronous standby attached".to_string());
            }

            for slot in slots {
                match slot.wal_status.as_deref() {
                    Some("lost") => issues.push(format!(
                        "replication slot '{}' has lost required WAL",
                        slot.slot_name
                    )),
                    Some("unreserved") => warnings.push(format!(
                        "replication slot '{}' is close to losing required WAL",
                        slot.slot_name
                    )),
                    _ => {}
                }
            }

            if archiver.failed_count > 0 {
                warnings.push(format!(
                    "WAL archiver has {} failed attempts (last: {})",
                    archiver.failed_count,
                    archiver.last_failed_wal.as_deref().unwrap_or("unknown")
                ));
            }
        }
        ReplicationStatus::Standby {
            receiver,
            recovery,
            lag,
        } => {
            if !receiver.running {
                issues.push("no WAL receiver running".to_string());
            }

            if let Some(lag_secs) = lag.lag_seconds {
                if lag_secs > bands.critical_lag_secs {
                    issues.push(format!(
                        "replication lag {:.1}s exceeds {:.0}s",
                        lag_secs, bands.critical_lag_secs
                    ));
                } else if lag_secs >= bands.warning_lag_secs {
                    warnings.push(format!(
                        "replication lag {:.1}s exceeds {:.0}s",
                        lag_secs, bands.warning_lag_secs
                    ));
                }
            }

            if recovery.replay_paused {
                warnings.push("WAL replay is paused".to_string());
            }
        }
    }

    let level = if !issues.is_empty() {
        HealthLevel::Critical
    } else if !warnings.is_empty() {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    };

    ReplicationHealth {
        level,
        issues,
        warnings,
    }
}
