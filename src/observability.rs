use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests executed. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "parkd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "parkd_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations created.
pub const BOOKINGS_TOTAL: &str = "parkd_bookings_total";

/// Counter: booking attempts rejected for a window conflict.
pub const BOOKING_CONFLICTS_TOTAL: &str = "parkd_booking_conflicts_total";

/// Counter: stale Occupied flags released by the sweep.
pub const SPOTS_RELEASED_TOTAL: &str = "parkd_spots_released_total";

/// Counter: failed login attempts.
pub const AUTH_FAILURES_TOTAL: &str = "parkd_auth_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
