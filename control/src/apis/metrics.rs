//! Controller metrics
//!
//! Reconciliation, endpoint resolution and certificate automation counters,
//! exposed by the control server on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation cycle duration
    static ref RECONCILE_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "gatehouse_reconcile_duration_seconds",
            "Reconciliation cycle duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["sync"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliation cycles total
    static ref RECONCILE_CYCLES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "gatehouse_reconcile_cycles_total",
            "Total number of reconciliation cycles",
        );
        let counter = IntCounterVec::new(opts, &["sync"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Endpoint resolution failures, per service
    static ref ENDPOINT_RESOLUTION_FAILURES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "gatehouse_endpoint_resolution_failures_total",
            "Total number of failed endpoint resolutions",
        );
        let counter = IntCounterVec::new(opts, &["service"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Certificate issue attempts by result
    static ref CERTIFICATE_ISSUES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "gatehouse_acme_certificate_issues_total",
            "Total number of ACME certificate issue attempts",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Dependency links currently tracked
    static ref TRACKED_LINKS: IntGauge = {
        let gauge = IntGauge::new(
            "gatehouse_tracked_links",
            "Number of dependency links currently tracked",
        )
        .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

/// Record a reconciliation cycle; `sync` is `full` or `partial`
pub fn record_reconcile_cycle(sync: &str, duration_secs: f64) {
    RECONCILE_DURATION
        .with_label_values(&[sync])
        .observe(duration_secs);
    RECONCILE_CYCLES_TOTAL.with_label_values(&[sync]).inc();
}

pub fn record_endpoint_resolution_failure(service: &str) {
    ENDPOINT_RESOLUTION_FAILURES_TOTAL
        .with_label_values(&[service])
        .inc();
}

/// Record a certificate issue attempt (`issued`, `sign_error`, `store_error`)
pub fn record_certificate_issue(result: &str) {
    CERTIFICATE_ISSUES_TOTAL.with_label_values(&[result]).inc();
}

pub fn set_tracked_links(count: usize) {
    TRACKED_LINKS.set(count as i64);
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_gathered() {
        record_reconcile_cycle("full", 0.01);
        record_certificate_issue("issued");
        record_endpoint_resolution_failure("default/web");
        set_tracked_links(3);

        let output = gather_controller_metrics().expect("Should gather metrics");
        assert!(output.contains("gatehouse_reconcile_cycles_total"));
        assert!(output.contains("gatehouse_acme_certificate_issues_total"));
        assert!(output.contains("gatehouse_endpoint_resolution_failures_total"));
        assert!(output.contains("gatehouse_tracked_links"));
    }
}
