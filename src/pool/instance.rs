//! Per-instance connection pool
//!
//! Checkout is bounded by the instance's max connections via a semaphore;
//! excess borrowers queue until a permit frees up. Idle connections are kept
//! for reuse and recycled by age. The borrow guard returns the connection on
//! every exit path, including early returns and panics in the caller.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_postgres::Client;
use tracing::debug;

use crate::config::PoolConfig;

use super::connection::PgConn;
use super::PoolError;

pub struct InstancePool {
    config: tokio_postgres::Config,
    connect_timeout: Duration,
    max_idle: usize,
    max_age: Duration,
    max_connections: u32,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PgConn>>,
    checked_out: AtomicUsize,
    closed: AtomicBool,
}

impl InstancePool {
    pub fn new(
        config: tokio_postgres::Config,
        settings: &PoolConfig,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            config,
            connect_timeout,
            max_idle: settings.max_idle,
            max_age: Duration::from_secs(settings.max_age_secs),
            max_connections,
            semaphore: Arc::new(Semaphore::new(max_connections as usize)),
            idle: Mutex::new(VecDeque::new()),
            checked_out: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow a connection, reusing an idle one when possible
    ///
    /// Queues on the semaphore when all permits are taken; the permit is
    /// released when the returned guard drops.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::PoolClosed)?;

        let conn = match self.pop_idle().await {
            Some(conn) => {
                debug!("Reusing idle connection");
                conn
            }
            None => {
                debug!("Dialing new connection");
                PgConn::connect(&self.config, self.connect_timeout).await?
            }
        };

        self.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConn {
            conn: ManuallyDrop::new(conn),
            pool: Arc::downgrade(self),
            permit: Some(permit),
            broken: false,
        })
    }

    /// Pop the first usable idle connection, discarding closed/expired ones
    async fn pop_idle(&self) -> Option<PgConn> {
        let mut idle = self.idle.lock().await;
        while let Some(conn) = idle.pop_front() {
            if conn.is_closed() {
                debug!("Discarding closed idle connection");
                continue;
            }
            if conn.is_expired(self.max_age) {
                debug!("Connection expired, discarding");
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Return a connection to the idle set (drops it if the pool is full,
    /// closed, or the connection is no longer usable)
    pub(crate) async fn put(&self, conn: PgConn) {
        if self.closed.load(Ordering::SeqCst) || conn.is_closed() || conn.is_expired(self.max_age) {
            debug!("Connection not returnable, discarding");
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max_idle {
            debug!("Idle set full, discarding connection");
            return;
        }
        idle.push_back(conn);
        debug!(idle_count = idle.len(), "Returned connection to pool");
    }

    /// Number of connections currently checked out
    pub fn in_use(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Number of idle connections held
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Close the pool: reject new borrowers, wait for in-flight borrowers to
    /// finish, then drop all idle connections
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        // Holding every permit means every borrower has returned.
        match self.semaphore.acquire_many(self.max_connections).await {
            Ok(permit) => {
                self.semaphore.close();
                drop(permit);
            }
            Err(_) => {
                // Semaphore already closed by a concurrent close
            }
        }

        let mut idle = self.idle.lock().await;
        let drained = idle.len();
        idle.clear();
        debug!(drained, "Closed pool");
    }
}

/// Borrow guard for a pooled connection
///
/// Returns the connection (and frees the semaphore permit) when dropped.
/// Mark it broken to have it discarded instead of reused.
pub struct PooledConn {
    conn: ManuallyDrop<PgConn>,
    pool: Weak<InstancePool>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl PooledConn {
    pub fn client(&self) -> &Client {
        self.conn.client()
    }

    /// Prevent this connection from returning to the idle set
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // Safety: the connection is moved out exactly once, here, and the
        // guard is not usable afterwards.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        let permit = self.permit.take();

        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        pool.checked_out.fetch_sub(1, Ordering::SeqCst);

        if !self.broken && !conn.is_closed() {
            // Return asynchronously; the permit frees once the
            // connection is back in the idle set.
            tokio::spawn(async move {
                pool.put(conn).await;
                drop(permit);
            });
        } else {
            drop(permit);
        }
    }
}
