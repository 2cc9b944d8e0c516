use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static RUN_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static CACHE_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let run_counter = RUN_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("runs_total", "Completed runs by terminal status"),
            &["status"],
        )
        .unwrap()
    });

    let cache_counter = CACHE_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("answer_cache_lookups_total", "Answer cache lookups by result"),
            &["result"],
        )
        .unwrap()
    });

    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("job_queue_depth", "Unacknowledged jobs in the broker").unwrap()
    });

    let run_duration = RUN_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "run_duration_seconds",
            "Wall-clock time from worker pickup to terminal write",
        ))
        .unwrap()
    });

    REGISTRY.register(Box::new(run_counter.clone())).ok();
    REGISTRY.register(Box::new(cache_counter.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(run_duration.clone())).ok();
}

pub fn inc_run(status: &str) {
    if let Some(counter) = RUN_COUNTER.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn inc_cache(result: &str) {
    if let Some(counter) = CACHE_COUNTER.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn inc_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub fn observe_run_duration(seconds: f64) {
    if let Some(histogram) = RUN_DURATION.get() {
        histogram.observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
