//! Prometheus metrics for the pgfleet core
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// pgfleet metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Pool metrics
    /// Current number of live per-instance pools
    pub pools_active: IntGauge,
    /// Total pools created
    pub pools_created_total: IntCounter,
    /// Total pools evicted by the idle cleanup
    pub pools_evicted_total: IntCounter,

    // Query metrics
    /// Total queries executed, by result
    pub queries_total: IntCounterVec,
    /// Query latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
    /// Query errors by type
    pub query_errors_total: IntCounterVec,

    // Probe metrics
    /// Connection probes by result
    pub probes_total: IntCounterVec,

    // Topology metrics
    /// Cluster topology refreshes by result
    pub topology_refresh_total: IntCounterVec,

    // Failover metrics
    /// Failovers by kind and outcome
    pub failovers_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let pools_active = IntGauge::new(
            "pgfleet_pools_active",
            "Current number of live per-instance connection pools",
        )
        .unwrap();

        let pools_created_total = IntCounter::new(
            "pgfleet_pools_created_total",
            "Total number of connection pools created",
        )
        .unwrap();

        let pools_evicted_total = IntCounter::new(
            "pgfleet_pools_evicted_total",
            "Total number of connection pools evicted while idle",
        )
        .unwrap();

        let queries_total = IntCounterVec::new(
            Opts::new("pgfleet_queries_total", "Total number of queries executed"),
            &["result"], // ok, error
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pgfleet_query_duration_seconds",
                "Query latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                10.0,
            ]),
            &["result"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("pgfleet_query_errors_total", "Total number of query errors"),
            &["type"], // execute, timeout, connect, etc.
        )
        .unwrap();

        let probes_total = IntCounterVec::new(
            Opts::new(
                "pgfleet_probes_total",
                "Total number of connection probes by result",
            ),
            &["result"], // success, failure
        )
        .unwrap();

        let topology_refresh_total = IntCounterVec::new(
            Opts::new(
                "pgfleet_topology_refresh_total",
                "Total number of cluster topology refreshes by result",
            ),
            &["result"], // ok, partial, error
        )
        .unwrap();

        let failovers_total = IntCounterVec::new(
            Opts::new(
                "pgfleet_failovers_total",
                "Total number of failovers by kind and outcome",
            ),
            &["kind", "outcome"], // kind: failover/switchover, outcome: completed/failed
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(pools_active.clone())).unwrap();
        registry
            .register(Box::new(pools_created_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pools_evicted_total.clone()))
            .unwrap();
        registry.register(Box::new(queries_total.clone())).unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry.register(Box::new(probes_total.clone())).unwrap();
        registry
            .register(Box::new(topology_refresh_total.clone()))
            .unwrap();
        registry
            .register(Box::new(failovers_total.clone()))
            .unwrap();

        Self {
            registry,
            pools_active,
            pools_created_total,
            pools_evicted_total,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            probes_total,
            topology_refresh_total,
            failovers_total,
        }
    }

    /// Record a pool creation
    pub fn record_pool_created(&self) {
        self.pools_created_total.inc();
        self.pools_active.inc();
    }

    /// Record a pool eviction by the idle cleanup
    pub fn record_pool_evicted(&self) {
        self.pools_evicted_total.inc();
        self.pools_active.dec();
    }

    /// Record an explicit pool close
    pub fn record_pool_closed(&self) {
        self.pools_active.dec();
    }

    /// Record a query execution
    pub fn record_query(&self, result: &str, duration_secs: f64) {
        self.queries_total.with_label_values(&[result]).inc();
        self.query_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    /// Record a query error
    pub fn record_query_error(&self, error_type: &str) {
        self.query_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    /// Record a connection probe result
    pub fn record_probe(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.probes_total.with_label_values(&[result]).inc();
    }

    /// Record a topology refresh result
    pub fn record_topology_refresh(&self, result: &str) {
        self.topology_refresh_total
            .with_label_values(&[result])
            .inc();
    }

    /// Record a finished failover
    pub fn record_failover(&self, kind: &str, outcome: &str) {
        self.failovers_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
