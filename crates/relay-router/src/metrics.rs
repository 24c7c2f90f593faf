//! Prometheus-compatible metrics with the router's stable names.

use metrics::{counter, gauge};

/// Number of messages currently tracked as in-flight.
pub fn set_tracker_size(size: usize) {
    gauge!("router.tracker.size").set(size as f64);
}

pub fn set_pools_active(count: usize) {
    gauge!("router.pools.active").set(count as f64);
}

pub fn set_pool_queue_size(pool: &str, size: u32) {
    gauge!("router.pool.queue.size", "pool" => pool.to_string()).set(size as f64);
}

pub fn set_pool_active_workers(pool: &str, count: u32) {
    gauge!("router.pool.workers.active", "pool" => pool.to_string()).set(count as f64);
}

/// A message referenced an unknown pool code and fell back to the default pool.
pub fn record_default_pool_usage() {
    counter!("router.default_pool.usage").increment(1);
}

pub fn record_message_processed(queue: &str, ok: bool) {
    counter!(
        "router.messages.processed",
        "queue" => queue.to_string(),
        "ok" => ok.to_string()
    )
    .increment(1);
}

/// Deferred back to the broker (duplicate, pool full, rate limited) -
/// not a processing failure.
pub fn record_message_deferred(queue: &str) {
    counter!("router.messages.deferred", "queue" => queue.to_string()).increment(1);
}

pub fn set_broker_available(queue: &str, available: u64) {
    gauge!("router.broker.available", "queue" => queue.to_string()).set(available as f64);
}
