//! Testing utilities for the sensor ring.
//!
//! This module provides tools for running whole rings in one process:
//! - [`LocalNetwork`], an in-memory transport with crash and message loss injection
//! - [`RecordingSink`], a gateway that remembers every publication
//! - [`TestRing`], a ring of controllers wired over a [`LocalNetwork`]
//!
//! # Example
//!
//! ```rust,ignore
//! use sensor_ring::testing::TestRing;
//!
//! let mut ring = TestRing::new();
//! ring.join(1).await;
//! ring.join(2).await;
//!
//! // Crash node 2: its address stops answering.
//! ring.crash(2);
//! ```

mod local;
mod sink;

#[cfg(test)]
pub(crate) mod utils;

pub use local::{LinkFault, LocalNetwork};
pub use sink::{PublishedRound, RecordingSink};

use crate::acquisition::{MeasurementSink, Pm10Simulator, SlidingWindowReducer};
use crate::config::{NodeConfig, TimeoutConfig, WindowConfig};
use crate::node::{NodeController, RingMessageHandler};
use crate::types::{HostMap, NodeId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Address used for `id` on a [`TestRing`].
pub fn test_address(id: NodeId) -> String {
    format!("localhost:{}", 8079 + id)
}

/// A node running on a [`TestRing`].
pub struct TestNode {
    pub controller: Arc<NodeController>,
    pub reducer: Arc<SlidingWindowReducer>,
    simulator: Pm10Simulator,
}

impl TestNode {
    fn stop(&self) {
        self.simulator.stop();
        self.controller.shutdown();
    }
}

/// A ring of controllers for integration testing.
pub struct TestRing {
    network: LocalNetwork,
    sink: Arc<RecordingSink>,
    timeouts: TimeoutConfig,
    hop_delay: Duration,
    sample_interval: Duration,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl Default for TestRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRing {
    /// Create an empty ring with fast timeouts.
    pub fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            sink: Arc::new(RecordingSink::new()),
            timeouts: TimeoutConfig::fast(),
            hop_delay: Duration::from_millis(10),
            sample_interval: Duration::from_millis(5),
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_hop_delay(mut self, delay: Duration) -> Self {
        self.hop_delay = delay;
        self
    }

    /// Start node `id` with every live node as its initial hint.
    pub async fn join(&mut self, id: NodeId) -> Arc<NodeController> {
        let hints: HostMap = self
            .nodes
            .keys()
            .map(|&other| (other, test_address(other)))
            .collect();

        let config = NodeConfig::new(id, test_address(id))
            .with_initial_hosts(hints)
            .with_hop_delay(self.hop_delay)
            .with_timeouts(self.timeouts.clone())
            .with_window(WindowConfig {
                capacity: 1,
                overlap: 1.0,
            });

        let reducer = Arc::new(SlidingWindowReducer::new(config.window.clone()));
        let controller = NodeController::new(
            &config,
            Arc::new(self.network.clone()),
            reducer.clone(),
            self.sink.clone(),
        );
        self.network.register(
            test_address(id),
            Arc::new(RingMessageHandler::new(controller.clone())),
        );
        let simulator = Pm10Simulator::spawn(
            format!("pm10-{}", id),
            reducer.clone() as Arc<dyn MeasurementSink>,
            self.sample_interval,
        );

        self.nodes.insert(
            id,
            TestNode {
                controller: controller.clone(),
                reducer,
                simulator,
            },
        );

        if let Err(e) = controller.start().await {
            tracing::warn!(node_id = id, error = %e, "Test node failed to start");
        }
        controller
    }

    /// Kill node `id`: its address stops answering and its tasks stop.
    pub fn crash(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.network.crash(&test_address(id));
            node.stop();
        }
    }

    pub fn controller(&self, id: NodeId) -> Option<&Arc<NodeController>> {
        self.nodes.get(&id).map(|n| &n.controller)
    }

    /// Ids of the live nodes.
    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn sink(&self) -> &Arc<RecordingSink> {
        &self.sink
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Every live node agrees on the live membership and no round is open.
    pub fn converged(&self) -> bool {
        let ids = self.ids();
        self.nodes.values().all(|node| {
            node.controller.topology().known_ids() == ids && !node.controller.is_discovering()
        })
    }

    /// Sensor token generations minted across live nodes.
    pub fn tokens_minted(&self) -> u64 {
        self.nodes
            .values()
            .map(|n| n.controller.metrics().sensor_tokens_minted)
            .sum()
    }

    /// A round covering exactly the live nodes was published after the first
    /// `skip` rounds.
    pub fn published_full_round_since(&self, skip: usize) -> bool {
        let ids = self.ids();
        self.sink
            .rounds_since(skip)
            .iter()
            .any(|round| round.participants() == ids)
    }

    /// Stop every node.
    pub fn shutdown(&mut self) {
        for (id, node) in std::mem::take(&mut self.nodes) {
            node.stop();
            self.network.unregister(&test_address(id));
        }
    }
}

impl Drop for TestRing {
    fn drop(&mut self) {
        self.shutdown();
    }
}
