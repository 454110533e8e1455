//! Prometheus-compatible metrics for the broker bridge

use metrics::{counter, gauge};

use crate::BreakerState;

/// Record a borrow that timed out waiting for a channel
pub fn record_pool_exhausted(pool: &str) {
    counter!("chatrelay_pool_exhausted_total", "pool" => pool.to_string()).increment(1);
}

/// Record a dead channel dropped instead of re-admitted
pub fn record_channel_discarded(pool: &str) {
    counter!("chatrelay_pool_channels_discarded_total", "pool" => pool.to_string()).increment(1);
}

pub fn set_pool_in_use(pool: &str, in_use: usize) {
    gauge!("chatrelay_pool_channels_in_use", "pool" => pool.to_string()).set(in_use as f64);
}

pub fn record_publish(room_id: &str, success: bool) {
    if success {
        counter!("chatrelay_published_total", "room" => room_id.to_string()).increment(1);
    } else {
        counter!("chatrelay_publish_failures_total", "room" => room_id.to_string()).increment(1);
    }
}

pub fn record_breaker_rejected(breaker: &str) {
    counter!("chatrelay_breaker_rejected_total", "breaker" => breaker.to_string()).increment(1);
}

pub fn record_breaker_transition(breaker: &str, to: BreakerState) {
    counter!(
        "chatrelay_breaker_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}
