use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static POLL_BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_poll_batches_total",
        "long-poll responses carrying updates by scope kind",
        &["scope"],
    )
});

pub static POLL_HEARTBEATS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_poll_heartbeats_total",
        "long-poll responses without updates by scope kind",
        &["scope"],
    )
});

pub static POLL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_poll_failures_total",
        "failed long-poll requests by scope kind",
        &["scope"],
    )
});

pub static PUSH_CONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_push_connects_total",
        "push socket connection attempts by outcome",
        &["result"],
    )
});

pub static PUSH_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_push_events_total",
        "inbound push frames by disposition",
        &["kind"],
    )
});

pub static READ_RECEIPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_read_receipts_total",
        "mark-as-read calls by result",
        &["result"],
    )
});

pub static STALE_BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "console_sync_stale_batches_total",
        "batches discarded because their binding was torn down",
        &["scope"],
    )
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
