//! Protocol counters for one ring node.
//!
//! All values are lock-free atomics so the RPC path, timers and dispatch tasks
//! can record without contention. [`NodeMetrics::snapshot`] gives a plain copy
//! for tests and reports.

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::{FloatGauge, Gauge};

use crate::types::NodeId;
use tracing::info;

/// Metrics of a ring node.
#[derive(Debug)]
pub struct NodeMetrics {
    // Sensor token stream
    pub sensor_tokens_received: Counter,
    pub sensor_tokens_forwarded: Counter,
    pub sensor_tokens_held: Counter,
    pub sensor_tokens_minted: Counter,
    pub sensor_rounds_completed: Counter,
    pub sensor_tokens_duplicate: Counter,

    // Discovery stream
    pub discovery_rounds_started: Counter,
    pub discovery_rounds_completed: Counter,
    pub discovery_tokens_discarded: Counter,

    // Failures
    pub unreachable_peers_skipped: Counter,
    pub isolations: Counter,
    pub timeouts_fired: Counter,
    pub publish_failures: Counter,

    pub ring_size: Gauge,
    pub last_round_average: FloatGauge,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            sensor_tokens_received: Counter::new(
                "ring_sensor_tokens_received_total",
                "Sensor tokens received from the predecessor",
            ),
            sensor_tokens_forwarded: Counter::new(
                "ring_sensor_tokens_forwarded_total",
                "Sensor tokens acknowledged by the successor",
            ),
            sensor_tokens_held: Counter::new(
                "ring_sensor_tokens_held_total",
                "Sensor tokens parked during discovery",
            ),
            sensor_tokens_minted: Counter::new(
                "ring_sensor_tokens_minted_total",
                "Sensor token generations created by this node",
            ),
            sensor_rounds_completed: Counter::new(
                "ring_sensor_rounds_completed_total",
                "Sensor rounds completed on this node",
            ),
            sensor_tokens_duplicate: Counter::new(
                "ring_sensor_tokens_duplicate_total",
                "Copies of completed generations dropped",
            ),
            discovery_rounds_started: Counter::new(
                "ring_discovery_rounds_started_total",
                "Discovery rounds started by this node",
            ),
            discovery_rounds_completed: Counter::new(
                "ring_discovery_rounds_completed_total",
                "Final memberships adopted",
            ),
            discovery_tokens_discarded: Counter::new(
                "ring_discovery_tokens_discarded_total",
                "Stale or duplicate discovery tokens dropped",
            ),
            unreachable_peers_skipped: Counter::new(
                "ring_unreachable_peers_skipped_total",
                "Successors skipped because they did not answer",
            ),
            isolations: Counter::new(
                "ring_isolations_total",
                "Times every successor was unreachable",
            ),
            timeouts_fired: Counter::new("ring_timeouts_fired_total", "Ring timeouts that fired"),
            publish_failures: Counter::new(
                "ring_publish_failures_total",
                "Failed publications to the gateway",
            ),
            ring_size: Gauge::new("ring_size"),
            last_round_average: FloatGauge::new("ring_last_round_average"),
        }
    }

    fn counters(&self) -> [&Counter; 13] {
        [
            &self.sensor_tokens_received,
            &self.sensor_tokens_forwarded,
            &self.sensor_tokens_held,
            &self.sensor_tokens_minted,
            &self.sensor_rounds_completed,
            &self.sensor_tokens_duplicate,
            &self.discovery_rounds_started,
            &self.discovery_rounds_completed,
            &self.discovery_tokens_discarded,
            &self.unreachable_peers_skipped,
            &self.isolations,
            &self.timeouts_fired,
            &self.publish_failures,
        ]
    }

    /// Log every metric at info level.
    pub fn log_summary(&self, node_id: NodeId) {
        for counter in self.counters() {
            info!(node_id, metric = counter.name(), value = counter.get(), "{}", counter.help());
        }
        info!(node_id, metric = self.ring_size.name(), value = self.ring_size.get());
        info!(
            node_id,
            metric = self.last_round_average.name(),
            value = self.last_round_average.get()
        );
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            sensor_tokens_received: self.sensor_tokens_received.get(),
            sensor_tokens_forwarded: self.sensor_tokens_forwarded.get(),
            sensor_tokens_held: self.sensor_tokens_held.get(),
            sensor_tokens_minted: self.sensor_tokens_minted.get(),
            sensor_rounds_completed: self.sensor_rounds_completed.get(),
            sensor_tokens_duplicate: self.sensor_tokens_duplicate.get(),
            discovery_rounds_started: self.discovery_rounds_started.get(),
            discovery_rounds_completed: self.discovery_rounds_completed.get(),
            discovery_tokens_discarded: self.discovery_tokens_discarded.get(),
            unreachable_peers_skipped: self.unreachable_peers_skipped.get(),
            isolations: self.isolations.get(),
            timeouts_fired: self.timeouts_fired.get(),
            publish_failures: self.publish_failures.get(),
            ring_size: self.ring_size.get(),
            last_round_average: self.last_round_average.get(),
        }
    }
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetricsSnapshot {
    pub sensor_tokens_received: u64,
    pub sensor_tokens_forwarded: u64,
    pub sensor_tokens_held: u64,
    pub sensor_tokens_minted: u64,
    pub sensor_rounds_completed: u64,
    pub sensor_tokens_duplicate: u64,
    pub discovery_rounds_started: u64,
    pub discovery_rounds_completed: u64,
    pub discovery_tokens_discarded: u64,
    pub unreachable_peers_skipped: u64,
    pub isolations: u64,
    pub timeouts_fired: u64,
    pub publish_failures: u64,
    pub ring_size: u64,
    pub last_round_average: f64,
}
