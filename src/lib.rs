//! Peer-to-peer sensor ring.
//!
//! Nodes organize themselves into a logical ring ordered by id, elect a
//! coordinator to agree on membership, and circulate a single token that
//! collects one sensor reading per node before the round is published
//! upstream.
//!
//! # Features
//!
//! - Ring ordering derived from the known member ids
//! - Chang–Roberts style discovery that also merges membership
//! - Token circulation with a sliding-window reading per node
//! - Failure detection by per-hop timeouts, skipping of dead successors
//!   and regeneration of a lost token
//!
//! # Example
//!
//! ```rust,no_run
//! use sensor_ring::{GatewayMode, NodeConfig, SensorNode};
//! use sensor_ring::gateway::sink_for;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut peers = sensor_ring::HostMap::new();
//!     peers.insert(2, "127.0.0.1:9002".to_string());
//!
//!     let config = NodeConfig::new(1, "127.0.0.1:9001")
//!         .with_initial_hosts(peers)
//!         .with_gateway(GatewayMode::Disabled);
//!     let sink = sink_for(&config.gateway)?;
//!
//!     let node = SensorNode::start(config, sink).await?;
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        NetworkServer / PeerClient           │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │             NodeController                  │
//! │  • on_sensor_token / on_discovery_token     │
//! │  • on_new_neighbour                         │
//! │  • timeouts and successor dispatch          │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌───────────┐  ┌────────────┐
//! │   Ring   │  │ Discovery │  │ Acquisition│
//! │ Topology │  │  Engine   │  │  (window,  │
//! │          │  │           │  │   token)   │
//! └──────────┘  └───────────┘  └────────────┘
//! ```

pub mod acquisition;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod network;
pub mod node;
pub mod ring;
pub mod testing;
pub mod timer;
pub mod types;

// Re-export main types for convenience
pub use config::{GatewayMode, NodeConfig, TimeoutConfig, WindowConfig};
pub use error::{Error, Result};
pub use node::{NodeController, SensorNode};
pub use types::{HostMap, NodeId, NodeInfo, Reading};

pub use acquisition::{SensorReadingsToken, SlidingWindowReducer, TokenCirculationEngine};
pub use discovery::{DiscoveryEngine, DiscoveryToken, ParticipationState};
pub use gateway::{GatewaySink, SensorDataAverage};
pub use metrics::{NodeMetrics, NodeMetricsSnapshot};
pub use ring::RingTopology;
pub use timer::{TimeoutKind, TimeoutScheduler};
