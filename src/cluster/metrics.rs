//! Prometheus metrics for the broker.
//!
//! Metrics cover:
//! - Ingestion (appends, acks, publish latency)
//! - Replication (requests served, entries shipped, ISR changes)
//! - Subscriptions (live subscribers, delivered messages, terminal statuses)
//! - Metadata (applied operations, fatal apply failures)
//! - Transport (dropped messages)
//!
//! All metrics are registered to a custom registry with the "logbridge" prefix.
//! Registration errors fall back to an unregistered metric instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for broker metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("logbridge".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Ingestion
// =============================================================================

define_counter_vec!(
    MESSAGES_APPENDED,
    "messages_appended_total",
    "Messages durably appended by partition leaders",
    ["stream"]
);
define_counter_vec!(
    ACKS_PUBLISHED,
    "acks_published_total",
    "Acks published to producer inboxes",
    ["policy"]
);
define_histogram_vec!(
    PUBLISH_DURATION,
    "publish_duration_seconds",
    "Latency of gateway publish calls",
    ["mode", "status"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);

// =============================================================================
// Replication
// =============================================================================

define_counter_vec!(
    REPLICATION_REQUESTS,
    "replication_requests_total",
    "Replication requests served by leaders",
    ["status"]
);
define_counter!(
    REPLICATED_ENTRIES,
    "replicated_entries_total",
    "Entries shipped from leaders to followers"
);
define_counter_vec!(
    ISR_CHANGES,
    "isr_changes_total",
    "ISR shrink and expand proposals",
    ["change"]
);
define_gauge_vec!(
    PARTITION_ROLES,
    "partition_roles",
    "Local partitions by role",
    ["role"]
);

// =============================================================================
// Subscriptions
// =============================================================================

define_gauge!(
    ACTIVE_SUBSCRIBERS,
    "active_subscribers",
    "Live subscriptions across all partitions"
);
define_counter!(
    MESSAGES_DELIVERED,
    "messages_delivered_total",
    "Messages handed to subscriber delivery channels"
);
define_counter_vec!(
    SUBSCRIPTION_TERMINATIONS,
    "subscription_terminations_total",
    "Subscriptions ended by a terminal status",
    ["code"]
);

// =============================================================================
// Metadata
// =============================================================================

define_counter_vec!(
    METADATA_APPLIED,
    "metadata_applied_total",
    "Metadata operations applied by the state machine",
    ["op"]
);
define_counter!(
    METADATA_FATAL,
    "metadata_fatal_total",
    "Metadata operations that failed to apply locally"
);
define_histogram_vec!(
    PROPOSAL_DURATION,
    "metadata_proposal_duration_seconds",
    "Latency of metadata proposals",
    ["status"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);

// =============================================================================
// Transport
// =============================================================================

define_counter_vec!(
    TRANSPORT_DROPPED,
    "transport_dropped_total",
    "Messages dropped by the local transport",
    ["reason"]
);

// =============================================================================
// Safe Registration Helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a gateway publish.
pub fn record_publish(mode: &str, status: &str, duration_secs: f64) {
    PUBLISH_DURATION
        .with_label_values(&[mode, status])
        .observe(duration_secs);
}

/// Record a metadata proposal.
pub fn record_proposal(status: &str, duration_secs: f64) {
    PROPOSAL_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = MESSAGES_APPENDED.with_label_values(&["metrics-test"]).get();
        MESSAGES_APPENDED.with_label_values(&["metrics-test"]).inc();
        assert_eq!(
            MESSAGES_APPENDED.with_label_values(&["metrics-test"]).get(),
            before + 1
        );
    }

    #[test]
    fn test_encode_contains_prefix() {
        METADATA_APPLIED.with_label_values(&["create_stream"]).inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("logbridge_metadata_applied_total"));
    }
}
