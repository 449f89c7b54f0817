use drover_harness::{HarnessConfig, ReportRecord, ReportValue};

/// Configuration with a fast polling cadence and short budgets
pub fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.process.wait_timeout_secs = 60;
    config.polling.interval_ms = 1000;
    config.polling.start_timeout_secs = 10;
    config.polling.operation_timeout_secs = 60;
    config.polling.max_transient_retries = 3;
    config.polling.backoff_base_ms = 100;
    config.polling.backoff_max_ms = 400;
    config
}

/// Feeder summary JSON as printed by a feed client
pub fn feeder_output(seconds: f64, ok_count: u64, error_count: u64) -> String {
    serde_json::json!({
        "feeder.seconds": seconds,
        "feeder.ok.count": ok_count,
        "feeder.error.count": error_count,
        "http.exception.count": 0,
        "http.request.bytes": ok_count * 1024,
        "http.response.bytes": ok_count * 64,
        "http.response.latency.millis.min": 1,
        "http.response.latency.millis.avg": 5.5,
        "http.response.latency.millis.max": 120,
    })
    .to_string()
}

/// Record with the given parameters and metrics
pub fn record_with(parameters: &[(&str, ReportValue)], metrics: &[(&str, f64)]) -> ReportRecord {
    let mut record = ReportRecord::new();
    for (name, value) in parameters {
        record.add_parameter(*name, value.clone());
    }
    for (name, value) in metrics {
        record.add_metric(*name, *value);
    }
    record
}
