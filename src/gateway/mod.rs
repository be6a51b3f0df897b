//! Upstream aggregation service.
//!
//! The ring reports finished sensor rounds and final memberships to a
//! gateway. Publishing is best effort: callers log failures and carry on.

mod file;
mod http;

pub use file::FileLoggerSink;
pub use http::HttpGateway;

use crate::config::GatewayMode;
use crate::error::Result;
use crate::types::{HostMap, NodeId, Reading};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

/// Average of one sensor round as stored by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataAverage {
    pub participating_nodes: BTreeSet<NodeId>,
    pub average: f64,
}

impl SensorDataAverage {
    /// Summarize a round's readings.
    pub fn from_readings(readings: &BTreeMap<NodeId, Reading>) -> Self {
        let values: Vec<f64> = readings.values().copied().collect();
        Self {
            participating_nodes: readings.keys().copied().collect(),
            average: crate::acquisition::average(&values),
        }
    }
}

/// Destination of ring results.
#[async_trait]
pub trait GatewaySink: Send + Sync + 'static {
    /// Register this node and get the other known nodes.
    async fn join(&self, id: NodeId, address: &str) -> Result<HostMap>;

    /// Publish the readings of a completed sensor round.
    async fn publish_readings(
        &self,
        sender_id: NodeId,
        readings: &BTreeMap<NodeId, Reading>,
    ) -> Result<()>;

    /// Publish the membership agreed by a discovery round.
    async fn publish_membership(&self, sender_id: NodeId, hosts: &HostMap) -> Result<()>;
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl GatewaySink for LoggingSink {
    async fn join(&self, _id: NodeId, _address: &str) -> Result<HostMap> {
        Ok(HostMap::new())
    }

    async fn publish_readings(
        &self,
        sender_id: NodeId,
        readings: &BTreeMap<NodeId, Reading>,
    ) -> Result<()> {
        let summary = SensorDataAverage::from_readings(readings);
        info!(
            node_id = sender_id,
            nodes = ?summary.participating_nodes,
            average = summary.average,
            "Sensor round published"
        );
        Ok(())
    }

    async fn publish_membership(&self, sender_id: NodeId, hosts: &HostMap) -> Result<()> {
        info!(node_id = sender_id, members = ?hosts, "Membership published");
        Ok(())
    }
}

/// Build the sink selected by `mode`.
pub fn sink_for(mode: &GatewayMode) -> Result<Arc<dyn GatewaySink>> {
    Ok(match mode {
        GatewayMode::Mock { log_path } => Arc::new(FileLoggerSink::new(log_path.clone())),
        GatewayMode::Remote { base_url } => Arc::new(HttpGateway::new(base_url)?),
        GatewayMode::Disabled => Arc::new(LoggingSink),
    })
}
