//! Prometheus metrics for Cumulus storage nodes
//!
//! Exposes archive, retrieve, handoff and channel metrics.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Metric names as constants
pub mod names {
    // Write coordinator
    pub const ARCHIVES_TOTAL: &str = "cumulus_archives_total";
    pub const ARCHIVE_FAILURES: &str = "cumulus_archive_failures_total";
    pub const ARCHIVE_BYTES: &str = "cumulus_archive_bytes";
    pub const ARCHIVE_DURATION: &str = "cumulus_archive_duration_seconds";

    // Read coordinator
    pub const RETRIEVES_TOTAL: &str = "cumulus_retrieves_total";
    pub const RETRIEVE_FAILURES: &str = "cumulus_retrieve_failures_total";
    pub const RETRIEVE_BYTES: &str = "cumulus_retrieve_bytes";

    // Node-side services
    pub const WRITER_REQUESTS: &str = "cumulus_writer_requests_total";
    pub const READER_REQUESTS: &str = "cumulus_reader_requests_total";

    // Handoff
    pub const HANDOFFS_FORWARDED: &str = "cumulus_handoffs_forwarded_total";
    pub const HANDOFF_FAILURES: &str = "cumulus_handoff_failures_total";
    pub const HANDOFF_PURGES: &str = "cumulus_handoff_purges_total";
    pub const HANDOFFS_PENDING: &str = "cumulus_handoffs_pending";

    // Health
    pub const CONNECTED_WRITERS: &str = "cumulus_connected_writers";
    pub const NODE_UP: &str = "cumulus_node_up";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::ARCHIVES_TOTAL, "Archives completed by this node");
    describe_counter!(names::ARCHIVE_FAILURES, "Archives that failed and were cancelled");
    describe_counter!(names::ARCHIVE_BYTES, "Unencoded bytes archived");
    describe_histogram!(names::ARCHIVE_DURATION, "Time from first send to final reply in seconds");

    describe_counter!(names::RETRIEVES_TOTAL, "Retrieves started by this node");
    describe_counter!(names::RETRIEVE_FAILURES, "Retrieves that failed");
    describe_counter!(names::RETRIEVE_BYTES, "Decoded bytes returned to callers");

    describe_counter!(names::WRITER_REQUESTS, "Requests handled by the data writer");
    describe_counter!(names::READER_REQUESTS, "Requests handled by the data reader");

    describe_counter!(names::HANDOFFS_FORWARDED, "Handoffs forwarded into local storage");
    describe_counter!(names::HANDOFF_FAILURES, "Handoff items that failed");
    describe_counter!(names::HANDOFF_PURGES, "Purge requests sent to handoff sources");
    describe_gauge!(names::HANDOFFS_PENDING, "Handoffs waiting to be forwarded");

    describe_gauge!(names::CONNECTED_WRITERS, "Data writers currently reachable");
    describe_gauge!(names::NODE_UP, "Whether the node is up (1) or down (0)");
}

/// Install the Prometheus recorder with its own HTTP listener
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_archive(bytes: u64, duration: Duration) {
    counter!(names::ARCHIVES_TOTAL).increment(1);
    counter!(names::ARCHIVE_BYTES).increment(bytes);
    histogram!(names::ARCHIVE_DURATION).record(duration.as_secs_f64());
}

pub fn record_archive_failure() {
    counter!(names::ARCHIVE_FAILURES).increment(1);
}

pub fn record_retrieve(bytes: u64) {
    counter!(names::RETRIEVES_TOTAL).increment(1);
    counter!(names::RETRIEVE_BYTES).increment(bytes);
}

pub fn record_retrieve_failure() {
    counter!(names::RETRIEVE_FAILURES).increment(1);
}

pub fn record_writer_request(message_type: &'static str) {
    counter!(names::WRITER_REQUESTS, "message_type" => message_type).increment(1);
}

pub fn record_reader_request(message_type: &'static str) {
    counter!(names::READER_REQUESTS, "message_type" => message_type).increment(1);
}

pub fn record_handoff(forwarded: bool) {
    if forwarded {
        counter!(names::HANDOFFS_FORWARDED).increment(1);
    } else {
        counter!(names::HANDOFF_FAILURES).increment(1);
    }
}

pub fn record_handoff_purge() {
    counter!(names::HANDOFF_PURGES).increment(1);
}

pub fn set_pending_handoffs(count: usize) {
    gauge!(names::HANDOFFS_PENDING).set(count as f64);
}

pub fn set_connected_writers(count: usize) {
    gauge!(names::CONNECTED_WRITERS).set(count as f64);
}

pub fn set_node_up(up: bool) {
    gauge!(names::NODE_UP).set(if up { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        init_metrics();
        record_archive(1024, Duration::from_millis(5));
        record_writer_request("archive-key-start");
        set_pending_handoffs(3);
        set_node_up(true);
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            names::ARCHIVES_TOTAL,
            names::RETRIEVE_BYTES,
            names::HANDOFF_PURGES,
            names::CONNECTED_WRITERS,
        ] {
            assert!(name.starts_with("cumulus_"));
        }
    }
}
