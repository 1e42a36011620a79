//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tubeq_models::{JobStatus, Priority, QueueStats};

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config(format!("Failed to install Prometheus exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    // Admission
    pub const JOBS_ENQUEUED_TOTAL: &str = "tubeq_jobs_enqueued_total";
    pub const ADMISSION_REJECTED_TOTAL: &str = "tubeq_admission_rejected_total";

    // Outcomes
    pub const JOBS_COMPLETED_TOTAL: &str = "tubeq_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "tubeq_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "tubeq_jobs_retried_total";
    pub const JOBS_STALLED_TOTAL: &str = "tubeq_jobs_stalled_total";
    pub const JOB_DURATION_SECONDS: &str = "tubeq_job_duration_seconds";

    // Queue
    pub const QUEUE_JOBS: &str = "tubeq_queue_jobs";
    pub const JOBS_EVICTED_TOTAL: &str = "tubeq_jobs_evicted_total";
}

pub fn record_job_enqueued(priority: Priority) {
    let labels = [("priority", priority_label(priority))];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

pub fn record_admission_rejected() {
    counter!(names::ADMISSION_REJECTED_TOTAL).increment(1);
}

pub fn record_job_completed(format: &str, duration_secs: f64) {
    let labels = [("format", format.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

/// `reason` is one of `transient`, `terminal`, `conversion`, `stalled`, `panic`.
pub fn record_job_failed(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_retried() {
    counter!(names::JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_job_stalled() {
    counter!(names::JOBS_STALLED_TOTAL).increment(1);
}

pub fn record_jobs_evicted(status: JobStatus, count: usize) {
    let labels = [("status", status.as_str().to_string())];
    counter!(names::JOBS_EVICTED_TOTAL, &labels).increment(count as u64);
}

pub fn set_queue_stats(stats: &QueueStats) {
    for status in JobStatus::ALL {
        let labels = [("status", status.as_str().to_string())];
        gauge!(names::QUEUE_JOBS, &labels).set(stats.get(status) as f64);
    }
}

fn priority_label(priority: Priority) -> String {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
    }
    .to_string()
}
