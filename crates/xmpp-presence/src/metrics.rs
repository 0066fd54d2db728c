//! Presence metrics.
//!
//! Uses the global OpenTelemetry meter provider, which must be installed by
//! the host server. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("xmpp-presence"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for presence stanzas processed.
pub fn presences_processed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.presence.processed")
        .with_description("Total presence stanzas processed")
        .with_unit("stanza")
        .build()
}

/// Counter for subscription verbs handled.
pub fn subscription_verbs() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.presence.subscriptions")
        .with_description("Total subscription verbs handled")
        .with_unit("stanza")
        .build()
}

/// Counter for answered probes.
pub fn probes() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.presence.probes")
        .with_description("Total presence probes answered")
        .with_unit("probe")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for online resources held in the registry.
pub fn online_resources() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.presence.online")
        .with_description("Current number of online resources")
        .with_unit("resource")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for presence processing latency.
pub fn presence_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.presence.latency")
        .with_description("Presence processing latency")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a presence stanza being processed.
pub fn record_presence(kind: &str, success: bool) {
    presences_processed().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record a subscription verb.
pub fn record_subscription(verb: &str) {
    subscription_verbs().add(1, &[KeyValue::new("verb", verb.to_string())]);
}

/// Record a probe outcome (`replayed`, `denied`, `empty` or `forwarded`).
pub fn record_probe(outcome: &'static str) {
    probes().add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Record the registry size.
pub fn record_online_count(count: usize) {
    online_resources().record(count as i64, &[]);
}

/// Record presence processing latency in milliseconds.
pub fn record_presence_latency(latency_ms: f64, kind: &str) {
    presence_latency().record(latency_ms, &[KeyValue::new("kind", kind.to_string())]);
}
