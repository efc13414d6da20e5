use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (booked, no_availability,
/// slot_taken, conflict, rejected).
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Counter: cancellations. Labels: restore (merge, extend_left, extend_right, insert).
pub const CANCELLATIONS_TOTAL: &str = "slotbook_cancellations_total";

/// Counter: calendar lock waits that hit the transaction timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "slotbook_lock_timeouts_total";

// ── Resource utilization ────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: loaded marketplaces.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Counter: startup/auth failures, including unknown caller ids.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertProfessional { .. } => "insert_professional",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::UpdateAvailability { .. } => "update_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointmentStatus { .. } => "update_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
    }
}
