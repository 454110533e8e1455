//! Prometheus-compatible metrics for the send side

use metrics::{counter, histogram};
use std::time::Duration;

pub fn record_acknowledged(room_id: &str, attempts: u32, latency: Duration) {
    counter!("chatrelay_send_acknowledged_total", "room" => room_id.to_string()).increment(1);
    histogram!("chatrelay_send_attempts", "room" => room_id.to_string()).record(attempts as f64);
    histogram!("chatrelay_send_latency_seconds", "room" => room_id.to_string()).record(latency.as_secs_f64());
}

/// Record a send that exhausted its attempts
pub fn record_terminal_failure(room_id: &str) {
    counter!("chatrelay_send_terminal_failures_total", "room" => room_id.to_string()).increment(1);
}

pub fn record_retry(room_id: &str, reason: &str) {
    counter!(
        "chatrelay_send_retries_total",
        "room" => room_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_connection_evicted(room_id: &str) {
    counter!("chatrelay_send_connections_evicted_total", "room" => room_id.to_string()).increment(1);
}
