//! Prometheus metrics surface for a cluster node.
//!
//! Kept in the teacher's own shape (`metrics.rs`): `lazy_static` metric
//! statics registered once, a hyper `make_service_fn`/`service_fn` handler
//! serving `/metrics`, and a `start_metrics_server` helper spawned once at
//! startup. The metric set itself is new — replication/cluster counters
//! instead of load-generator counters.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};
use std::env;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "skorekeeper".to_string());

    pub static ref RAFT_APPLIED_INDEX: Gauge =
        Gauge::with_opts(
            Opts::new("raft_applied_index", "Last Raft log index applied by this node")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RAFT_IS_LEADER: Gauge =
        Gauge::with_opts(
            Opts::new("raft_is_leader", "1 if this node is the current Raft leader")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CLUSTER_LEADER_GAP_MS: Gauge =
        Gauge::with_opts(
            Opts::new("cluster_leader_gap_ms", "Wall-clock gap since last leader contact, observed on acquiring leadership")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("http_requests_total", "Total app HTTP requests by route and status")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["route", "status"]
        ).unwrap();

    pub static ref ACTIVE_WS_CLIENTS: Gauge =
        Gauge::with_opts(
            Opts::new("active_ws_clients", "Number of currently connected WebSocket clients")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref HUB_REQUEST_LATENCY_SECONDS: Histogram =
        Histogram::with_opts(
            HistogramOpts::new(
                "hub_request_latency_seconds",
                "Latency of a hub request round-trip (load/save/action)."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref FORWARDED_REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("forwarded_requests_total", "Requests forwarded from a follower to the current leader")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref BROADCAST_DROPPED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("broadcast_dropped_total", "Broadcasts dropped because a hub's channel was full")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let r = prometheus::default_registry();
    r.register(Box::new(RAFT_APPLIED_INDEX.clone()))?;
    r.register(Box::new(RAFT_IS_LEADER.clone()))?;
    r.register(Box::new(CLUSTER_LEADER_GAP_MS.clone()))?;
    r.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    r.register(Box::new(ACTIVE_WS_CLIENTS.clone()))?;
    r.register(Box::new(HUB_REQUEST_LATENCY_SECONDS.clone()))?;
    r.register(Box::new(FORWARDED_REQUESTS_TOTAL.clone()))?;
    r.register(Box::new(BROADCAST_DROPPED_TOTAL.clone()))?;
    Ok(())
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Starts the Prometheus metrics HTTP server. Intended to be
/// `tokio::spawn`ed once at node startup, mirroring the teacher's
/// `start_metrics_server`/`start_health_server` task-spawn idiom.
pub async fn start_metrics_server(addr: SocketAddr) {
    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, hyper::Error>(service_fn(metrics_handler))
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "Metrics server listening");
    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_start_at_zero() {
        assert_eq!(RAFT_IS_LEADER.get(), 0.0);
    }
}
