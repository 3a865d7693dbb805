// Prometheus metrics definitions for the session engine.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// 1 while a spawned session is active.
    pub static ref SESSION_ACTIVE: IntGauge =
        IntGauge::new("afk_session_active", "Whether a spawned session is active").unwrap();

    /// Consecutive failed attempts since the last successful spawn.
    pub static ref CONSECUTIVE_FAILURES: IntGauge = IntGauge::new(
        "afk_consecutive_failures",
        "Consecutive failed attempts since the last spawn",
    )
    .unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Connection attempts, by protocol version.
    pub static ref CONNECTION_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("afk_connection_attempts_total", "Total connection attempts"),
        &["version"],
    )
    .unwrap();

    /// Session failures, by failure class.
    pub static ref SESSION_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("afk_session_failures_total", "Total session failures"),
        &["class"],
    )
    .unwrap();

    pub static ref RETRIES_SCHEDULED_TOTAL: IntCounter = IntCounter::new(
        "afk_retries_scheduled_total",
        "Total reconnect attempts scheduled",
    )
    .unwrap();

    pub static ref VERSION_ROTATIONS_TOTAL: IntCounter = IntCounter::new(
        "afk_version_rotations_total",
        "Total moves to the next protocol version candidate",
    )
    .unwrap();

    /// Outbound actions sent, by kind (move, animate, text).
    pub static ref ACTIONS_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("afk_actions_sent_total", "Total outbound actions sent"),
        &["kind"],
    )
    .unwrap();

    /// Activity ticks that produced no action, by activity kind.
    pub static ref ACTIONS_SKIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("afk_actions_skipped_total", "Total activity ticks skipped"),
        &["kind"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time from spawn to teardown, in seconds.
    pub static ref SESSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("afk_session_duration_seconds", "Active session duration in seconds")
            .buckets(vec![10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 43200.0, 86400.0]),
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SESSION_ACTIVE.clone()),
        Box::new(CONSECUTIVE_FAILURES.clone()),
        Box::new(CONNECTION_ATTEMPTS_TOTAL.clone()),
        Box::new(SESSION_FAILURES_TOTAL.clone()),
        Box::new(RETRIES_SCHEDULED_TOTAL.clone()),
        Box::new(VERSION_ROTATIONS_TOTAL.clone()),
        Box::new(ACTIONS_SENT_TOTAL.clone()),
        Box::new(ACTIONS_SKIPPED_TOTAL.clone()),
        Box::new(SESSION_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::warn!("Failed to register metric: {}", e);
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
