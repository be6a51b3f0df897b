use super::{GatewaySink, SensorDataAverage};
use crate::error::{GatewayError, Result};
use crate::types::{host_map_from_nodes, HostMap, NodeId, NodeInfo, Reading};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST client for the gateway's `/node` endpoints.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    /// Create a client for the gateway at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        // Ensure base URL doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self { client, base_url })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/node/{}", self.base_url, endpoint)
    }

    async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<reqwest::Response> {
        let url = self.url(endpoint);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        debug!(%url, %status, "Gateway response");

        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                path: format!("/node/{}", endpoint),
            }
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl GatewaySink for HttpGateway {
    async fn join(&self, id: NodeId, address: &str) -> Result<HostMap> {
        let response = self.post("join", &NodeInfo::new(id, address)).await?;
        let nodes: Option<Vec<NodeInfo>> = response.json().await?;
        Ok(host_map_from_nodes(nodes.unwrap_or_default(), Some(id)))
    }

    async fn publish_readings(
        &self,
        _sender_id: NodeId,
        readings: &BTreeMap<NodeId, Reading>,
    ) -> Result<()> {
        self.post("publishNewAverage", &SensorDataAverage::from_readings(readings))
            .await?;
        Ok(())
    }

    async fn publish_membership(&self, _sender_id: NodeId, hosts: &HostMap) -> Result<()> {
        let nodes: Vec<NodeInfo> = hosts
            .iter()
            .map(|(id, host)| NodeInfo::new(*id, host.clone()))
            .collect();
        self.post("publishNewHosts", &nodes).await?;
        Ok(())
    }
}
