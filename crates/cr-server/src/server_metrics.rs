//! Prometheus-compatible metrics for ingress, fan-out and persistence

use metrics::{counter, gauge};

/// Record an inbound message that passed validation and was acknowledged
pub fn record_message_accepted(room_id: &str) {
    counter!("chatrelay_messages_accepted_total", "room" => room_id.to_string()).increment(1);
}

/// Record an acknowledged message that could not be forwarded to the broker
pub fn record_ingress_publish_failure(room_id: &str) {
    counter!("chatrelay_ingress_publish_failures_total", "room" => room_id.to_string()).increment(1);
}

/// Record an accepted message whose ack could not be written back to the sender
pub fn record_ack_write_failure(room_id: &str) {
    counter!("chatrelay_ack_write_failures_total", "room" => room_id.to_string()).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!("chatrelay_active_sessions").set(count as f64);
}

pub fn record_delivery(room_id: &str, acked: bool) {
    if acked {
        counter!("chatrelay_deliveries_acked_total", "room" => room_id.to_string()).increment(1);
    } else {
        counter!("chatrelay_deliveries_nacked_total", "room" => room_id.to_string()).increment(1);
    }
}

/// Record a broker ack or reject that failed; the delivery may be redelivered
pub fn record_settle_failure(room_id: &str, action: &'static str) {
    counter!("chatrelay_settle_failures_total", "room" => room_id.to_string(), "action" => action).increment(1);
}

pub fn record_consumer_restart(room_id: &str) {
    counter!("chatrelay_consumer_restarts_total", "room" => room_id.to_string()).increment(1);
}

pub fn record_broadcast(room_id: &str) {
    counter!("chatrelay_broadcasts_total", "room" => room_id.to_string()).increment(1);
}

/// Record a payload the write buffer refused after its bounded wait
pub fn record_write_rejected() {
    counter!("chatrelay_write_buffer_rejected_total").increment(1);
}

pub fn record_write_parse_failure() {
    counter!("chatrelay_write_parse_failures_total").increment(1);
}

pub fn record_write_batch(success: bool, rows: usize) {
    if success {
        counter!("chatrelay_write_batches_total").increment(1);
        counter!("chatrelay_rows_written_total").increment(rows as u64);
    } else {
        counter!("chatrelay_write_batches_failed_total").increment(1);
        counter!("chatrelay_rows_failed_total").increment(rows as u64);
    }
}

pub fn set_write_buffer_depth(depth: usize) {
    gauge!("chatrelay_write_buffer_depth").set(depth as f64);
}
