use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PUSH_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_push_messages_total",
        "Total frames received on the push channel"
    ))
    .unwrap();
    pub static ref PUSH_PARSE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_push_parse_failures_total",
        "Total push frames dropped because they were not valid JSON envelopes"
    ))
    .unwrap();
    pub static ref RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_push_reconnects_total",
        "Total reconnect attempts scheduled after the push channel closed"
    ))
    .unwrap();
    pub static ref PUSH_CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "dashboard_push_connected",
        "1 while the push channel is open"
    ))
    .unwrap();
    pub static ref INVALIDATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "dashboard_invalidations_total",
            "Cache invalidations issued by push notifications"
        ),
        &["query"]
    )
    .unwrap();
    pub static ref FETCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_fetches_total",
        "Total query fetch attempts"
    ))
    .unwrap();
    pub static ref FETCH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dashboard_fetch_failures_total",
        "Total query fetch attempts that failed"
    ))
    .unwrap();
    pub static ref FETCH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dashboard_fetch_latency_seconds",
            "Time taken by a query fetch including its retry"
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref MARKERS: Gauge = Gauge::with_opts(Opts::new(
        "dashboard_markers",
        "Markers currently placed on the map"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(register_metrics);
}

fn register_metrics() {
    REGISTRY
        .register(Box::new(PUSH_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PUSH_PARSE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(RECONNECTS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(PUSH_CONNECTED.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVALIDATIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(FETCHES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(FETCH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(FETCH_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(MARKERS.clone())).unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();

        let text = gather_metrics();
        assert!(text.contains("# TYPE dashboard_markers gauge"));
        assert!(text.contains("dashboard_fetch_latency_seconds_bucket"));
    }
}
