use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rentd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rentd_query_duration_seconds";

// ── Admission ───────────────────────────────────────────────────

/// Histogram: end-to-end booking admission latency in seconds, retries included.
pub const ADMISSION_DURATION_SECONDS: &str = "rentd_admission_duration_seconds";

/// Counter: bookings admitted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "rentd_bookings_admitted_total";

/// Counter: admissions refused. Labels: reason.
pub const ADMISSIONS_REJECTED_TOTAL: &str = "rentd_admissions_rejected_total";

/// Counter: optimistic transactions that lost a race and were retried or abandoned.
pub const SERIALIZATION_CONFLICTS_TOTAL: &str = "rentd_serialization_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "rentd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProduct { .. } => "insert_product",
        Command::InsertAsset { .. } => "insert_asset",
        Command::SetAssetStatus { .. } => "set_asset_status",
        Command::InsertCustomer { .. } => "insert_customer",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectProducts => "select_products",
        Command::SelectCustomers => "select_customers",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_prefixed_and_distinct() {
        let cmds = [
            Command::SelectProducts,
            Command::SelectCustomers,
            Command::SelectBookings {
                filter: crate::sql::BookingFilter::CurrentMonth,
            },
        ];
        let labels: Vec<_> = cmds.iter().map(command_label).collect();
        assert_eq!(labels, ["select_products", "select_customers", "select_bookings"]);
        assert!(QUERIES_TOTAL.starts_with("rentd_"));
    }
}
