use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetslot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetslot_wal_flush_batch_size";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: reservations made durable.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "fleetslot_reservations_committed_total";

/// Counter: bookings rejected because a slot was already held.
pub const BOOKING_CONFLICTS_TOTAL: &str = "fleetslot_booking_conflicts_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle(_) => "insert_vehicle",
        Command::InsertUser(_) => "insert_user",
        Command::BookSlots { .. } => "book_slots",
        Command::ImportReservations { .. } => "import_reservations",
        Command::SelectSlots => "select_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCompanyAvailability { .. } => "select_company_availability",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectUsers => "select_users",
    }
}
