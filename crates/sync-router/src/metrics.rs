//! Sync router metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application (sync-server). Without one, every instrument is
//! a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("sync-router"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stream registration attempts.
pub fn registrations() -> Counter<u64> {
    meter()
        .u64_counter("sync.registrations")
        .with_description("Total stream registration attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for updates placed on a connection queue.
pub fn updates_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("sync.updates.enqueued")
        .with_description("Total push updates enqueued for delivery")
        .with_unit("update")
        .build()
}

/// Counter for updates abandoned because their queue closed mid-dispatch.
pub fn updates_abandoned() -> Counter<u64> {
    meter()
        .u64_counter("sync.updates.abandoned")
        .with_description("Total push updates abandoned on a closed queue")
        .with_unit("update")
        .build()
}

/// Counter for updates written to a session server stream.
pub fn updates_sent() -> Counter<u64> {
    meter()
        .u64_counter("sync.updates.sent")
        .with_description("Total push updates written to session server streams")
        .with_unit("update")
        .build()
}

/// Counter for dispatch groups dropped without enqueueing.
pub fn groups_dropped() -> Counter<u64> {
    meter()
        .u64_counter("sync.groups.dropped")
        .with_description("Total dispatch groups dropped")
        .with_unit("group")
        .build()
}

/// Counter for delivery loop exits.
pub fn delivery_loop_exits() -> Counter<u64> {
    meter()
        .u64_counter("sync.delivery_loop.exits")
        .with_description("Total delivery loop terminations")
        .with_unit("exit")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for registered session server streams.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("sync.connections.active")
        .with_description("Current number of registered session server streams")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a registration attempt.
pub fn record_registration(success: bool) {
    registrations().add(
        1,
        &[KeyValue::new(
            "result",
            if success { "success" } else { "already_connected" },
        )],
    );
}

/// Record updates enqueued for one server.
pub fn record_updates_enqueued(count: u64) {
    if count > 0 {
        updates_enqueued().add(count, &[]);
    }
}

/// Record updates abandoned on a stale queue.
pub fn record_updates_abandoned(count: u64) {
    if count > 0 {
        updates_abandoned().add(count, &[]);
    }
}

/// Record one update written to a stream.
pub fn record_update_sent() {
    updates_sent().add(1, &[]);
}

/// Record a dropped dispatch group.
pub fn record_group_dropped(reason: &str) {
    groups_dropped().add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a delivery loop exit.
pub fn record_delivery_loop_exit(reason: &str) {
    delivery_loop_exits().add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record the current connection count.
pub fn record_connection_count(count: i64) {
    connections_active().record(count, &[]);
}
