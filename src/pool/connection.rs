//! A single live connection to a managed PostgreSQL server
//!
//! Connections are dialed with `tokio_postgres` and carry their own driver
//! task. Driver errors are logged, never fatal to the process.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_postgres::{Client, NoTls};
use tracing::debug;

use crate::inventory::{Credentials, ManagedInstance, SslMode};

use super::PoolError;

/// Parameters for an ad-hoc connection probe (no managed instance involved)
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Build a tokio-postgres config for a managed instance
pub(crate) fn instance_config(
    instance: &ManagedInstance,
    credentials: &Credentials,
) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&instance.host)
        .port(instance.port)
        .user(&credentials.username)
        .password(&credentials.password)
        .dbname(&instance.database)
        .ssl_mode(instance.ssl_mode.into())
        .connect_timeout(Duration::from_millis(instance.connect_timeout_ms));
    config
}

/// Build a tokio-postgres config from ad-hoc parameters
pub(crate) fn params_config(params: &ConnectParams) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .user(&params.username)
        .password(&params.password)
        .dbname(&params.database)
        .ssl_mode(params.ssl_mode.into())
        .connect_timeout(Duration::from_millis(params.connect_timeout_ms));
    config
}

/// A live connection with its spawned driver task
pub struct PgConn {
    client: Client,
    created_at: Instant,
    driver: tokio::task::JoinHandle<()>,
}

impl PgConn {
    /// Dial a new connection, bounded by the connect timeout
    pub async fn connect(
        config: &tokio_postgres::Config,
        connect_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let (client, connection) = tokio::time::timeout(connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| PoolError::ConnectTimeout(connect_timeout.as_millis() as u64))??;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Connection driver ended with error");
            }
        });

        Ok(Self {
            client,
            created_at: Instant::now(),
            driver,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether the server side has gone away
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Whether the connection exceeded its maximum age
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }
}

impl Drop for PgConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
