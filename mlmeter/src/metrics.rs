//! Prometheus metrics for token metering.
//!
//! Counters go through the `metrics` facade and are no-ops until a recorder is installed. When
//! `enable_metrics` is set the router installs the Prometheus recorder and renders it at
//! `/internal/metrics`.

use std::sync::OnceLock;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

use crate::types::Operation;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder on first use and return its handle.
pub fn get_or_install_prometheus_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_global_recorder(recorder) {
                // Another recorder owns the facade, so this handle will render nothing
                warn!("Failed to install Prometheus recorder: {}", e);
            }
            describe_metrics();
            handle
        })
        .clone()
}

fn describe_metrics() {
    describe_counter!("mlmeter_tokens_deducted_total", "Tokens deducted by admitted operations");
    describe_counter!(
        "mlmeter_admission_rejections_total",
        "Operations rejected before running, by reason"
    );
    describe_counter!("mlmeter_tokens_credited_total", "Tokens added through purchases and signup grants");
}

/// Record an admitted operation's charge
pub fn record_tokens_deducted(operation: Operation, amount: u64) {
    counter!("mlmeter_tokens_deducted_total", "operation" => operation.as_str()).increment(amount);
}

/// Record a rejection; `reason` is `rate_limited` or `insufficient_funds`
pub fn record_admission_rejection(operation: Operation, reason: &'static str) {
    counter!(
        "mlmeter_admission_rejections_total",
        "operation" => operation.as_str(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_tokens_credited(amount: u64) {
    counter!("mlmeter_tokens_credited_total").increment(amount);
}
