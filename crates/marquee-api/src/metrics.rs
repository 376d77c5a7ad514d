use marquee_security::Decision;
use marquee_sync::SyncReport;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static ACCESS_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("marquee_access_decisions_total", "Access verifications by outcome"),
        &["decision"],
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static SYNC_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("marquee_sync_runs_total", "Collection sync passes by result"),
        &["result"],
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static SYNC_ENTRY_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "marquee_sync_entry_failures_total",
        "Collection entries left pending after a sync pass",
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub fn record_decision(decision: &Decision) {
    let label = if decision.is_authorized() {
        "authorized"
    } else {
        "denied"
    };
    ACCESS_DECISIONS.with_label_values(&[label]).inc();
}

pub fn record_sync(report: Option<&SyncReport>) {
    match report {
        Some(r) if r.is_complete() => SYNC_RUNS.with_label_values(&["converged"]).inc(),
        Some(r) => {
            SYNC_RUNS.with_label_values(&["partial"]).inc();
            SYNC_ENTRY_FAILURES.inc_by(r.failures.len() as u64);
        }
        None => SYNC_RUNS.with_label_values(&["unavailable"]).inc(),
    }
}

/// Prometheus text exposition of every Marquee metric.
pub fn render() -> String {
    // Touch the lazies so an idle server still exposes the series.
    Lazy::force(&ACCESS_DECISIONS);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&SYNC_ENTRY_FAILURES);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
