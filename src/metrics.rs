//! Prometheus metrics for the stream coordinator.
//!
//! All metrics live on a custom registry with the "rivulet" prefix to avoid
//! name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully — if a metric fails
//! to register, a detached fallback metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for coordinator metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("rivulet".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric name");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels).expect("valid metric name");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid metric name");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    gauge
}

/// Commands applied to the replicated state machine, by command kind.
pub static COMMANDS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "commands_applied_total",
        "Commands applied to the coordinator state machine",
        &["command"],
    )
});

/// Phase tasks spawned by the aux executor, by phase name.
pub static PHASES_SPAWNED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "phases_spawned_total",
        "Phase tasks spawned by the aux executor",
        &["phase"],
    )
});

/// Phase tasks respawned after abnormal termination, by phase name.
pub static PHASE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "phase_retries_total",
        "Phase tasks respawned after abnormal termination",
        &["phase"],
    )
});

/// Completed stream leader elections.
pub static ELECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        &REGISTRY,
        "leader_elections_total",
        "Completed stream leader elections",
    )
});

/// Coordinator membership resize operations, by direction.
pub static MEMBERSHIP_RESIZES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        &REGISTRY,
        "membership_resizes_total",
        "Coordinator Raft members added or removed by the resize tick",
        &["direction"],
    )
});

/// Streams currently managed by this coordinator.
pub static STREAMS_MANAGED: Lazy<IntGauge> = Lazy::new(|| {
    register_gauge(
        &REGISTRY,
        "streams_managed",
        "Streams currently managed by the coordinator",
    )
});

/// Render all coordinator metrics in the Prometheus text format.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_without_panic() {
        COMMANDS_APPLIED.with_label_values(&["subscribe"]).inc();
        PHASES_SPAWNED.with_label_values(&["start_cluster"]).inc();
        PHASE_RETRIES.with_label_values(&["check_quorum"]).inc();
        ELECTIONS.inc();
        MEMBERSHIP_RESIZES.with_label_values(&["added"]).inc();
        STREAMS_MANAGED.set(3);
    }

    #[test]
    fn test_gather_contains_prefix() {
        ELECTIONS.inc();
        let text = gather();
        assert!(text.contains("rivulet_leader_elections_total"));
    }
}
