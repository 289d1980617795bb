//! Connection pooling for managed PostgreSQL instances
//!
//! One pool per managed instance, created lazily on first access and evicted
//! after 30 minutes without use. Checkout is bounded by the instance's
//! configured max connections; excess borrowers queue on the semaphore.

mod connection;
mod instance;
mod manager;
mod query;

pub use connection::{ConnectParams, PgConn};
pub use instance::{InstancePool, PooledConn};
pub use manager::{ConnectionCheck, PoolManager, PoolManagerStats, QueryOptions, QueryOutcome};
pub use query::FieldDescription;

use thiserror::Error;

/// Error raised by pooled connectivity
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),
    #[error("Credential resolution failed: {0}")]
    Credential(String),
    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("Pool is closed")]
    PoolClosed,
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}
