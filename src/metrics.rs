use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Row counter by outcome
    pub static ref ROWS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("rows_processed", "The number of rows processed"),
        &["outcome"]
    ).unwrap();
    // Group counter by outcome
    pub static ref GROUPS_POSTPROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("groups_postprocessed", "The number of groups post-processed"),
        &["outcome"]
    ).unwrap();
    // Execution histogram by stage (row or group)
    pub static ref EXECUTION_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("execution_time", "The time taken to reduce each row or group"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &["stage"],
    ).unwrap();
}

/// Register all metrics with [REGISTRY].
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(ROWS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(GROUPS_POSTPROCESSED.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_TIME.clone()))?;
    Ok(())
}

/// Render the registered metrics in the Prometheus text format.
pub fn metrics_text() -> Result<String, prometheus::Error> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Label value for the outcome of an execution.
pub fn outcome<T, E>(result: &Result<T, E>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(_) => "failure",
    }
}
