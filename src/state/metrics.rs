use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

use crate::proxy::TransferStats;

pub struct Metrics {
    registry: Registry,

    // Tunnel metrics
    pub tunnels_total: IntCounter,
    pub active_tunnels: IntGauge,
    pub tunnel_duration: Histogram,

    // Request metrics
    pub rejected_requests: IntCounter,
    pub dial_failures: IntCounter,

    // Traffic metrics
    pub bytes_upstream: IntCounter,
    pub bytes_downstream: IntCounter,

    // Connection metrics
    pub active_connections: IntGauge,
    pub refused_connections: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tunnels_total = IntCounter::new(
            "fabric_tunnel_tunnels_total",
            "Total number of established tunnels",
        )
        .expect("metric creation failed");
        let active_tunnels = IntGauge::new(
            "fabric_tunnel_active_tunnels",
            "Number of tunnels currently transferring",
        )
        .expect("metric creation failed");
        let tunnel_duration = Histogram::with_opts(HistogramOpts::new(
            "fabric_tunnel_tunnel_duration_seconds",
            "Tunnel lifetime in seconds",
        ))
        .expect("metric creation failed");

        let rejected_requests = IntCounter::new(
            "fabric_tunnel_rejected_requests_total",
            "CONNECT requests rejected before dialing",
        )
        .expect("metric creation failed");
        let dial_failures = IntCounter::new(
            "fabric_tunnel_dial_failures_total",
            "Outbound dials or inner handshakes that failed",
        )
        .expect("metric creation failed");

        let bytes_upstream = IntCounter::new(
            "fabric_tunnel_bytes_upstream_total",
            "Bytes copied from clients to outbound connections",
        )
        .expect("metric creation failed");
        let bytes_downstream = IntCounter::new(
            "fabric_tunnel_bytes_downstream_total",
            "Bytes copied from outbound connections to clients",
        )
        .expect("metric creation failed");

        let active_connections = IntGauge::new(
            "fabric_tunnel_active_connections",
            "Number of accepted client connections",
        )
        .expect("metric creation failed");
        let refused_connections = IntCounter::new(
            "fabric_tunnel_refused_connections_total",
            "Client connections dropped at the connection limit",
        )
        .expect("metric creation failed");

        registry.register(Box::new(tunnels_total.clone())).unwrap();
        registry.register(Box::new(active_tunnels.clone())).unwrap();
        registry
            .register(Box::new(tunnel_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(rejected_requests.clone()))
            .unwrap();
        registry.register(Box::new(dial_failures.clone())).unwrap();
        registry.register(Box::new(bytes_upstream.clone())).unwrap();
        registry
            .register(Box::new(bytes_downstream.clone()))
            .unwrap();
        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(refused_connections.clone()))
            .unwrap();

        Self {
            registry,
            tunnels_total,
            active_tunnels,
            tunnel_duration,
            rejected_requests,
            dial_failures,
            bytes_upstream,
            bytes_downstream,
            active_connections,
            refused_connections,
        }
    }

    pub fn record_rejected_request(&self) {
        self.rejected_requests.inc();
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.inc();
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.active_connections.dec();
    }

    pub fn record_refused_connection(&self) {
        self.refused_connections.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Registry contents in the Prometheus text exposition format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather_metrics(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Tracks one tunnel from establishment to teardown.
pub struct TunnelTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl TunnelTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.tunnels_total.inc();
        metrics.active_tunnels.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self, stats: &TransferStats) {
        self.metrics.bytes_upstream.inc_by(stats.upstream);
        self.metrics.bytes_downstream.inc_by(stats.downstream);
    }
}

impl Drop for TunnelTimer {
    fn drop(&mut self) {
        self.metrics.active_tunnels.dec();
        self.metrics
            .tunnel_duration
            .observe(self.start.elapsed().as_secs_f64());
    }
}
