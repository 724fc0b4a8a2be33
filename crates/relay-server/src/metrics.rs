//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. The JSON `/api/metrics` endpoint is built from
//! [`MetricsSnapshot`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tenvis_relay_core::HubStats;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const SESSIONS_ENDED: &str = "relay_sessions_ended_total";
    pub const HTTP_REQUESTS: &str = "relay_http_requests_total";
    pub const HTTP_LATENCY_SECONDS: &str = "relay_http_request_duration_seconds";
    pub const RATE_LIMITED: &str = "relay_rate_limited_total";
    pub const HUB_CLIENTS: &str = "relay_hub_clients";
    pub const HUB_BROADCASTS: &str = "relay_hub_broadcasts";
    pub const HUB_EVICTIONS: &str = "relay_hub_evictions";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of WebSocket connections"
    );
    metrics::describe_counter!(names::SESSIONS_ENDED, "Sessions ended, by reason");
    metrics::describe_counter!(names::HTTP_REQUESTS, "HTTP requests, by status");
    metrics::describe_histogram!(
        names::HTTP_LATENCY_SECONDS,
        "HTTP request latency in seconds"
    );
    metrics::describe_counter!(names::RATE_LIMITED, "Requests rejected by the rate limiter");
    metrics::describe_gauge!(names::HUB_CLIENTS, "Clients registered with the hub");
    metrics::describe_gauge!(names::HUB_BROADCASTS, "Broadcasts fanned out by the hub");
    metrics::describe_gauge!(names::HUB_EVICTIONS, "Slow clients evicted by the hub");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record why a session ended.
pub fn record_session_end(reason: &'static str) {
    counter!(names::SESSIONS_ENDED, "reason" => reason).increment(1);
}

/// Record a completed HTTP request.
pub fn record_request(status: u16, elapsed: Duration) {
    counter!(names::HTTP_REQUESTS, "status" => status.to_string()).increment(1);
    histogram!(names::HTTP_LATENCY_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a request rejected by the rate limiter.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED).increment(1);
}

/// Publish hub counters as gauges.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::HUB_CLIENTS).set(stats.clients as f64);
    gauge!(names::HUB_BROADCASTS).set(stats.broadcasts as f64);
    gauge!(names::HUB_EVICTIONS).set(stats.evictions as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Process statistics served by `/api/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the server started.
    pub uptime: u64,
    /// Resident memory of this process in MB.
    pub memory_usage: f64,
    /// Tasks alive on the runtime.
    pub num_tasks: usize,
    /// Available CPU parallelism.
    pub num_cpu: usize,
    /// Clients registered with the hub.
    pub connections: usize,
}

impl MetricsSnapshot {
    /// Collect a snapshot for the current process.
    #[must_use]
    pub fn collect(started: Instant, stats: &HubStats) -> Self {
        Self {
            uptime: started.elapsed().as_secs(),
            memory_usage: process_memory_mb(),
            num_tasks: tokio::runtime::Handle::current()
                .metrics()
                .num_alive_tasks(),
            num_cpu: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            connections: stats.clients,
        }
    }
}

fn process_memory_mb() -> f64 {
    let mut system = System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system
        .process(pid)
        .map_or(0.0, |p| p.memory() as f64 / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }

    #[tokio::test]
    async fn test_snapshot_reports_hub_clients() {
        let stats = HubStats {
            clients: 3,
            ..HubStats::default()
        };
        let snapshot = MetricsSnapshot::collect(Instant::now(), &stats);
        assert_eq!(snapshot.connections, 3);
        assert!(snapshot.num_cpu >= 1);
        assert_eq!(snapshot.uptime, 0);
        assert!(snapshot.memory_usage >= 0.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["uptime"].is_u64());
        assert!(json["memory_usage"].is_f64());
    }
}
