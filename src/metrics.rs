//! Admission metrics.
//!
//! Counters and histograms go through the `metrics` facade; without an
//! installed recorder they are no-ops, which is what tests rely on.

use std::net::SocketAddr;
use tracing::{info, warn};

pub const ADMITTED_TOTAL: &str = "oci_admission_admitted_total";
pub const REJECTED_TOTAL: &str = "oci_admission_rejected_total";
pub const DURATION_SECONDS: &str = "oci_admission_duration_seconds";

pub struct AdmissionMetrics;

impl AdmissionMetrics {
    pub fn record_admitted(source_name: &str, duration_secs: f64) {
        ::metrics::counter!(ADMITTED_TOTAL, "source" => source_name.to_string()).increment(1);
        ::metrics::histogram!(DURATION_SECONDS, "outcome" => "admitted").record(duration_secs);
    }

    pub fn record_rejected(source_name: &str, reason: &'static str, duration_secs: f64) {
        ::metrics::counter!(
            REJECTED_TOTAL,
            "source" => source_name.to_string(),
            "reason" => reason
        )
        .increment(1);
        ::metrics::histogram!(DURATION_SECONDS, "outcome" => "rejected").record(duration_secs);
    }

    /// Pre-register so the series show up before the first admission.
    pub fn register() {
        ::metrics::describe_counter!(ADMITTED_TOTAL, "Fetch attempts admitted, by source");
        ::metrics::describe_counter!(REJECTED_TOTAL, "Fetch attempts rejected, by source and reason");
        ::metrics::describe_histogram!(
            DURATION_SECONDS,
            ::metrics::Unit::Seconds,
            "Time spent deciding admission"
        );
    }
}

/// Install the Prometheus exporter on `addr`. Failing to bind only costs
/// observability, so it is logged rather than returned.
pub fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            AdmissionMetrics::register();
            info!("Prometheus exporter listening on http://{}/metrics", addr);
        }
        Err(e) => {
            warn!("Prometheus exporter install failed: {}", e);
        }
    }
}
