//! PostgreSQL fleet management core
//!
//! Pooled connectivity to managed instances, live replication topology
//! discovery with health classification, failover readiness scoring, and a
//! tracked failover/switchover orchestrator. Inventory CRUD and credential
//! management live in external collaborators behind the traits in
//! [`inventory`].

pub mod config;
pub mod failover;
pub mod inventory;
pub mod metrics;
pub mod pool;
pub mod replication;
