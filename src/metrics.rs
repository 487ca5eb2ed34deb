//! Recorder-agnostic telemetry for turnstile.
//!
//! This module mirrors admission events onto the `metrics` crate macros. It
//! does not embed an exporter: the application may install any compatible
//! recorder, and without one every call here is a no-op. The JSON served on
//! `/metrics` comes from [`MetricsSnapshot`] and does not depend on this module.
//!
//! Provided metrics:
//! * `turnstile_admissions_total` (counter)
//! * `turnstile_rejections_total` (counter, label `reason`)
//! * `turnstile_active_connections` (gauge)
//! * `turnstile_queued_connections` (gauge)
//! * `turnstile_queue_wait_seconds` (histogram)
//! * `turnstile_response_time_seconds` (histogram)
//! * `turnstile_http_requests_total` (counter, labels `method`, `status`)
//! * `turnstile_http_request_duration_seconds` (histogram, label `method`)
use std::time::{Duration, Instant};

use ::metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::{admission::RejectReason, stats::MetricsSnapshot};

pub const TURNSTILE_ADMISSIONS_TOTAL: &str = "turnstile_admissions_total";
pub const TURNSTILE_REJECTIONS_TOTAL: &str = "turnstile_rejections_total";
pub const TURNSTILE_ACTIVE_CONNECTIONS: &str = "turnstile_active_connections";
pub const TURNSTILE_QUEUED_CONNECTIONS: &str = "turnstile_queued_connections";
pub const TURNSTILE_QUEUE_WAIT_SECONDS: &str = "turnstile_queue_wait_seconds";
pub const TURNSTILE_RESPONSE_TIME_SECONDS: &str = "turnstile_response_time_seconds";
pub const TURNSTILE_HTTP_REQUESTS_TOTAL: &str = "turnstile_http_requests_total";
pub const TURNSTILE_HTTP_REQUEST_DURATION_SECONDS: &str =
    "turnstile_http_request_duration_seconds";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        TURNSTILE_ADMISSIONS_TOTAL,
        Unit::Count,
        "Requests granted a slot, directly or after queueing."
    );
    describe_counter!(
        TURNSTILE_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests refused a slot (by reason)."
    );
    describe_gauge!(
        TURNSTILE_ACTIVE_CONNECTIONS,
        "Requests currently holding a slot."
    );
    describe_gauge!(
        TURNSTILE_QUEUED_CONNECTIONS,
        "Requests currently waiting for a slot."
    );
    describe_histogram!(
        TURNSTILE_QUEUE_WAIT_SECONDS,
        Unit::Seconds,
        "Time spent queued before admission."
    );
    describe_histogram!(
        TURNSTILE_RESPONSE_TIME_SECONDS,
        Unit::Seconds,
        "Time between admission and release."
    );
    describe_counter!(
        TURNSTILE_HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "HTTP requests served (by method and status)."
    );
    describe_histogram!(
        TURNSTILE_HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end latency of HTTP requests."
    );
});

/// Register metric descriptions with the installed recorder (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing turnstile metrics descriptions");
    Lazy::force(&DESCRIPTIONS);
    Ok(())
}

/// Mirror the snapshot's point-in-time gauges.
pub fn publish_snapshot(snapshot: &MetricsSnapshot) {
    gauge!(TURNSTILE_ACTIVE_CONNECTIONS).set(snapshot.active_connections as f64);
    gauge!(TURNSTILE_QUEUED_CONNECTIONS).set(snapshot.queued_connections as f64);
}

/// Count an admission; `queue_wait` is zero for direct admissions.
pub fn record_admission(queue_wait: Duration) {
    counter!(TURNSTILE_ADMISSIONS_TOTAL).increment(1);
    histogram!(TURNSTILE_QUEUE_WAIT_SECONDS).record(queue_wait.as_secs_f64());
}

pub fn record_rejection(reason: RejectReason) {
    counter!(TURNSTILE_REJECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
}

pub fn record_response_time(duration: Duration) {
    histogram!(TURNSTILE_RESPONSE_TIME_SECONDS).record(duration.as_secs_f64());
}

/// RAII helper counting an HTTP request and recording its latency on drop.
pub struct HttpRequestTimer {
    start: Instant,
    method: String,
    status: u16,
}

impl HttpRequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
            status: 500,
        }
    }

    /// Set the status to report; requests that never get one count as 500.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for HttpRequestTimer {
    fn drop(&mut self) {
        counter!(
            TURNSTILE_HTTP_REQUESTS_TOTAL,
            "method" => self.method.clone(),
            "status" => self.status.to_string()
        )
        .increment(1);
        histogram!(TURNSTILE_HTTP_REQUEST_DURATION_SECONDS, "method" => self.method.clone())
            .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        publish_snapshot(&crate::core::stats::MetricsAggregator::new().snapshot());
        record_admission(Duration::from_millis(5));
        record_rejection(RejectReason::QueueTimeout);
        record_response_time(Duration::from_millis(20));
    }

    #[test]
    fn test_http_request_timer() {
        let mut timer = HttpRequestTimer::new("GET");
        timer.set_status(200);
        assert!(timer.elapsed() < Duration::from_secs(5));
        // Records on drop
        drop(timer);
    }
}
