//! Prometheus metrics for the experiment engine
//!
//! NOTE: No user_id or experiment_id in labels; both are unbounded.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Assignment Metrics
    // ============================================================================

    /// Assignment attempts by allocation method and outcome
    pub static ref ASSIGNMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("experiments_assignments_total", "Variant assignment attempts"),
        &["strategy", "outcome"]  // outcome: "created", "existing", "raced", "ineligible", "inactive", "no_variants"
    ).unwrap();

    // ============================================================================
    // Aggregation Metrics
    // ============================================================================

    /// Metric observations by result
    pub static ref METRIC_RECORD_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("experiments_metric_records_total", "Metric observations"),
        &["result"]  // result: "recorded", "rejected", "conflict"
    ).unwrap();

    /// Lost compare-and-swap attempts on result rows
    pub static ref RESULT_CAS_CONFLICTS_TOTAL: IntCounter = IntCounter::new(
        "experiments_result_cas_conflicts_total",
        "Result row compare-and-swap conflicts"
    ).unwrap();

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Config cache lookups
    pub static ref CONFIG_CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("experiments_config_cache_lookups_total", "Merged config cache lookups"),
        &["result"]  // result: "hit", "miss"
    ).unwrap();

    // ============================================================================
    // Lifecycle and Analysis Metrics
    // ============================================================================

    /// Experiment status transitions
    pub static ref EXPERIMENT_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("experiments_transitions_total", "Experiment status transitions"),
        &["to"]
    ).unwrap();

    /// Analysis duration
    pub static ref ANALYSIS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "experiments_analysis_duration_seconds",
            "Statistics recomputation duration"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5])
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    METRICS_REGISTRY.register(Box::new(ASSIGNMENTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(METRIC_RECORD_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(RESULT_CAS_CONFLICTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(CONFIG_CACHE_LOOKUPS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(EXPERIMENT_TRANSITIONS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(ANALYSIS_DURATION.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Records elapsed time to a histogram on drop (RAII)
/// Usage: let _timer = Timer::new(ANALYSIS_DURATION.clone());
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
