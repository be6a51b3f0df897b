//! A running ring node.
//!
//! [`SensorNode`] wires the TCP server, the PM10 simulator and the
//! [`NodeController`] together and owns their lifetimes.

mod controller;

pub use controller::{NodeController, RingMessageHandler};

use crate::acquisition::{MeasurementSink, Pm10Simulator, SlidingWindowReducer};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::gateway::GatewaySink;
use crate::network::{NetworkServer, TcpConnector, TransportConfig};
use crate::types::{HostMap, NodeId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// A sensor node taking part in the ring.
pub struct SensorNode {
    node_id: NodeId,
    local_addr: SocketAddr,
    controller: Arc<NodeController>,
    simulator: Pm10Simulator,

    /// Network server shutdown signal sender.
    shutdown_tx: mpsc::Sender<()>,
}

impl SensorNode {
    /// Start a node.
    ///
    /// This will:
    /// 1. Start the TCP server on the configured bind address
    /// 2. Start the PM10 simulator feeding the sliding window
    /// 3. Announce the node to its ring predecessor
    pub async fn start(config: NodeConfig, sink: Arc<dyn GatewaySink>) -> Result<Self> {
        config.validate()?;
        info!(node_id = config.node_id, address = %config.address, "Starting sensor node");

        let reducer = Arc::new(SlidingWindowReducer::new(config.window.clone()));
        let connector = Arc::new(TcpConnector::new(TransportConfig::from(&config.timeouts)));
        let controller = NodeController::new(&config, connector, reducer.clone(), sink);

        let handler = Arc::new(RingMessageHandler::new(controller.clone()));
        let (server, shutdown_tx) =
            NetworkServer::bind(config.get_bind_addr()?, config.node_id, handler).await?;
        let local_addr = server.local_addr()?;

        let node_id = config.node_id;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(node_id, error = %e, "Network server error");
            }
        });

        let simulator = Pm10Simulator::spawn(
            format!("pm10-{}", config.node_id),
            reducer as Arc<dyn MeasurementSink>,
            config.simulator_interval,
        );

        controller.start().await?;
        info!(node_id, %local_addr, "Sensor node started");

        Ok(Self {
            node_id,
            local_addr,
            controller,
            simulator,
            shutdown_tx,
        })
    }

    pub fn id(&self) -> NodeId {
        self.node_id
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn controller(&self) -> &Arc<NodeController> {
        &self.controller
    }

    pub fn known_hosts(&self) -> HostMap {
        self.controller.known_hosts()
    }

    /// Stop the node and log its metrics.
    pub async fn shutdown(&self) {
        info!(node_id = self.node_id, "Shutting down sensor node");

        self.simulator.stop();
        self.controller.shutdown();

        // Shutdown network server
        let _ = self.shutdown_tx.send(()).await;

        self.controller.metrics_handle().log_summary(self.node_id);
    }
}
