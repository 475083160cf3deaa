//! Prometheus metrics exposition
//!
//! Gateway-level metrics recorded here:
//!
//! - `relay_requests_total` (counter): labels `format`, `status`
//! - `relay_request_duration_seconds` (histogram): label `format`
//!
//! The dispatch crate records `relay_attempts_total`,
//! `relay_channel_disabled_total` and `relay_quota_refunds_total` through
//! the same global recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `relay_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than a summary. The range runs to 300s to cover long
/// streaming completions.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "relay_request_duration_seconds".to_string(),
            ),
            &[
                0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed relay request.
pub fn record_request(format: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "relay_requests_total",
        "format" => format.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "format" => format.to_string())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_request_is_a_noop_without_recorder() {
        record_request("chat", 200, 0.05);
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "relay_request_duration_seconds".to_string(),
                ),
                &[
                    0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
                ],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("chat", 200, 0.042);
        record_request("stream", 503, 1.5);

        let output = handle.render();
        assert!(output.contains("relay_requests_total"));
        assert!(output.contains("format=\"chat\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("format=\"stream\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("relay_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"300\""), "300s bucket must exist");
    }
}
