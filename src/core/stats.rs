//! Admission counters and response-time accumulation.
//!
//! [`MetricsAggregator`] is plain data mutated under the controller lock, so a
//! [`MetricsSnapshot`] always reflects one consistent point in time: a
//! completion never shows up in `total_response_time` without the admission
//! that preceded it being counted in `total_requests`.
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    total_requests: u64,
    rejected_connections: u64,
    active_connections: usize,
    queued_connections: usize,
    total_response_time: Duration,
}

/// Point-in-time copy of the aggregator, serialized verbatim by `/metrics`.
/// Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub active_connections: usize,
    pub queued_connections: usize,
    pub rejected_connections: u64,
    pub avg_response_time: f64,
    pub total_response_time: f64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&mut self) {
        self.total_requests += 1;
        self.active_connections += 1;
    }

    pub fn record_rejection(&mut self) {
        self.rejected_connections += 1;
    }

    /// Adjust the queued gauge by `delta` (`+1` on enqueue, `-1` on leaving the queue).
    pub fn record_queued(&mut self, delta: isize) {
        self.queued_connections = self.queued_connections.saturating_add_signed(delta);
    }

    pub fn record_completion(&mut self, duration: Duration) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.total_response_time += duration;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_response_time = self.total_response_time.as_secs_f64();
        let avg_response_time = if self.total_requests == 0 {
            0.0
        } else {
            total_response_time / self.total_requests as f64
        };

        MetricsSnapshot {
            total_requests: self.total_requests,
            active_connections: self.active_connections,
            queued_connections: self.queued_connections,
            rejected_connections: self.rejected_connections,
            avg_response_time,
            total_response_time,
        }
    }
}
