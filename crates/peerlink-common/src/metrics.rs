//! OpenTelemetry instruments for peering replication
//!
//! Every instrument is labelled with `peering` (the local peering name) so a
//! dashboard can line up the exporting and importing side of one relationship.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for peerlink metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("peerlink"));

// ============================================================================
// Stream Metrics
// ============================================================================

/// Counter of stream connection attempts
///
/// Labels:
/// - `peering`: local peering name
/// - `result`: connected, failed, rejected
pub static STREAM_CONNECT_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("peerlink_stream_connect_attempts_total")
        .with_description("Total number of replication stream connection attempts")
        .with_unit("{attempts}")
        .build()
});

/// Counter of inbound replication messages applied by the importer
///
/// Labels:
/// - `peering`: local peering name
/// - `kind`: snapshot, upsert, delete, root_update, address_update
pub static MESSAGES_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("peerlink_messages_applied_total")
        .with_description("Total number of replication messages applied")
        .with_unit("{messages}")
        .build()
});

/// Counter of resync requests (stale sequence or apply conflict)
///
/// Labels:
/// - `peering`: local peering name
pub static RESYNCS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("peerlink_resyncs_total")
        .with_description("Total number of snapshot resyncs requested by importers")
        .with_unit("{resyncs}")
        .build()
});

/// Counter of snapshots sent by the exporter
///
/// Labels:
/// - `peering`: local peering name
/// - `reason`: initial, compacted, resync
pub static SNAPSHOTS_SENT: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("peerlink_snapshots_sent_total")
        .with_description("Total number of full snapshots sent to peers")
        .with_unit("{snapshots}")
        .build()
});

/// Histogram of time between received stream messages, in seconds
///
/// Labels:
/// - `peering`: local peering name
pub static HEARTBEAT_AGE: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("peerlink_heartbeat_age_seconds")
        .with_description("Time since the previous message on a replication stream")
        .with_unit("s")
        .build()
});

// ============================================================================
// Catalog Metrics
// ============================================================================

/// Gauge of services imported from a peer
///
/// Labels:
/// - `peering`: local peering name
pub static IMPORTED_SERVICES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("peerlink_imported_services")
        .with_description("Number of services imported from the peer")
        .with_unit("{services}")
        .build()
});

/// Gauge of services exported to a peer
///
/// Labels:
/// - `peering`: local peering name
pub static EXPORTED_SERVICES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("peerlink_exported_services")
        .with_description("Number of services exported to the peer")
        .with_unit("{services}")
        .build()
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a connection attempt outcome
pub fn record_connect_attempt(peering: &str, result: &'static str) {
    STREAM_CONNECT_ATTEMPTS.add(
        1,
        &[
            KeyValue::new("peering", peering.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

/// Record one applied inbound message
pub fn record_message_applied(peering: &str, kind: &'static str) {
    MESSAGES_APPLIED.add(
        1,
        &[
            KeyValue::new("peering", peering.to_string()),
            KeyValue::new("kind", kind),
        ],
    );
}

/// Record a resync request
pub fn record_resync(peering: &str) {
    RESYNCS.add(1, &[KeyValue::new("peering", peering.to_string())]);
}

/// Record a snapshot sent to a peer
pub fn record_snapshot_sent(peering: &str, reason: &'static str) {
    SNAPSHOTS_SENT.add(
        1,
        &[
            KeyValue::new("peering", peering.to_string()),
            KeyValue::new("reason", reason),
        ],
    );
}

/// Record the gap since the previous message on a stream
pub fn record_heartbeat_age(peering: &str, age: std::time::Duration) {
    HEARTBEAT_AGE.record(
        age.as_secs_f64(),
        &[KeyValue::new("peering", peering.to_string())],
    );
}

/// Set the imported service gauge for a peering
pub fn set_imported_services(peering: &str, count: u64) {
    IMPORTED_SERVICES.record(count, &[KeyValue::new("peering", peering.to_string())]);
}

/// Set the exported service gauge for a peering
pub fn set_exported_services(peering: &str, count: u64) {
    EXPORTED_SERVICES.record(count, &[KeyValue::new("peering", peering.to_string())]);
}
