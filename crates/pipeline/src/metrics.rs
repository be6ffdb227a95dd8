//! Pipeline metrics
//!
//! Recorded through the `metrics` facade; the embedding binary decides
//! whether a recorder is installed.
//!
//! - `imgshrink_requests_total` (counter): labels `stage`, `outcome`
//! - `imgshrink_request_failures_total` (counter): label `kind`
//! - `imgshrink_tasks_total` (counter): label `outcome`
//! - `imgshrink_task_duration_seconds` (histogram)
//! - `imgshrink_saved_bytes_total` (counter)
//! - `imgshrink_credential_usage` (gauge): label `index`

use std::time::Duration;

use key_pool::ErrorKind;

use crate::events::Stage;

/// Histogram buckets for `imgshrink_task_duration_seconds`, 100ms to 5min.
pub const TASK_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

pub const TASK_DURATION_METRIC: &str = "imgshrink_task_duration_seconds";

pub fn record_request(stage: Stage, success: bool) {
    let outcome = if success { "success" } else { "error" };
    metrics::counter!("imgshrink_requests_total", "stage" => stage.label(), "outcome" => outcome)
        .increment(1);
}

pub fn record_failure(kind: ErrorKind) {
    metrics::counter!("imgshrink_request_failures_total", "kind" => kind.label()).increment(1);
}

pub fn record_task(outcome: &'static str, duration: Duration) {
    metrics::counter!("imgshrink_tasks_total", "outcome" => outcome).increment(1);
    metrics::histogram!(TASK_DURATION_METRIC).record(duration.as_secs_f64());
}

pub fn record_saved_bytes(bytes: u64) {
    metrics::counter!("imgshrink_saved_bytes_total").increment(bytes);
}

pub fn record_credential_usage(index: usize, used: u64) {
    metrics::gauge!("imgshrink_credential_usage", "index" => index.to_string()).set(used as f64);
}
