use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Discovery metrics
    pub static ref IMAGES_DISCOVERED: IntCounter = IntCounter::new(
        "images_discovered_total",
        "Total number of image nodes seen by discovery"
    ).unwrap();

    pub static ref IMAGES_SKIPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("images_skipped_total", "Total number of images skipped by reason"),
        &["reason"]
    ).unwrap();

    // Scheduler metrics
    pub static ref IMAGES_SCORED: IntCounter = IntCounter::new(
        "images_scored_total",
        "Total number of images classified"
    ).unwrap();

    pub static ref IMAGES_ERRORED: IntCounter = IntCounter::new(
        "images_errored_total",
        "Total number of images whose classification failed"
    ).unwrap();

    pub static ref BATCH_CYCLES: IntCounter = IntCounter::new(
        "batch_cycles_total",
        "Total number of batch scheduler cycles"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "batch_queue_depth",
        "Current number of images waiting for classification"
    ).unwrap();

    // Bridge metrics
    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Inference round-trip latency in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    pub static ref BRIDGE_TIMEOUTS: IntCounter = IntCounter::new(
        "bridge_timeouts_total",
        "Total number of inference requests that timed out"
    ).unwrap();

    pub static ref BRIDGE_STALE_RESPONSES: IntCounter = IntCounter::new(
        "bridge_stale_responses_total",
        "Total number of responses ignored for unknown correlation ids"
    ).unwrap();

    // Saliency metrics
    pub static ref SALIENCY_CACHE_HITS: IntCounter = IntCounter::new(
        "saliency_cache_hits_total",
        "Total number of saliency cache hits"
    ).unwrap();

    pub static ref SALIENCY_CACHE_MISSES: IntCounter = IntCounter::new(
        "saliency_cache_misses_total",
        "Total number of saliency cache misses"
    ).unwrap();

    pub static ref SALIENCY_ACTIVE_JOBS: IntGauge = IntGauge::new(
        "saliency_active_jobs",
        "Current number of running saliency jobs"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(IMAGES_DISCOVERED.clone()),
            Box::new(IMAGES_SKIPPED.clone()),
            Box::new(IMAGES_SCORED.clone()),
            Box::new(IMAGES_ERRORED.clone()),
            Box::new(BATCH_CYCLES.clone()),
            Box::new(QUEUE_DEPTH.clone()),
            Box::new(INFERENCE_LATENCY.clone()),
            Box::new(BRIDGE_TIMEOUTS.clone()),
            Box::new(BRIDGE_STALE_RESPONSES.clone()),
            Box::new(SALIENCY_CACHE_HITS.clone()),
            Box::new(SALIENCY_CACHE_MISSES.clone()),
            Box::new(SALIENCY_ACTIVE_JOBS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric collector");
            }
        }

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Get saliency cache hit rate as a percentage
pub fn saliency_hit_rate() -> f64 {
    let hits = SALIENCY_CACHE_HITS.get() as f64;
    let misses = SALIENCY_CACHE_MISSES.get() as f64;
    let total = hits + misses;

    if total == 0.0 {
        0.0
    } else {
        (hits / total) * 100.0
    }
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();
        IMAGES_DISCOVERED.inc();
        let text = export_metrics();
        assert!(text.contains("images_discovered_total"));
    }
}
