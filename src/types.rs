//! Core types used throughout the sensor ring.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node identifier in the ring.
///
/// Ids are assigned externally, are unique across the network and never change
/// during a node's lifetime. The ring order is the ascending order of ids.
pub type NodeId = u64;

/// A reduced sensor reading (e.g. a windowed average).
pub type Reading = f64;

/// Membership snapshot: node id to `host:port` address.
///
/// Ordered so that every snapshot iterates in ring order.
pub type HostMap = BTreeMap<NodeId, String>;

/// A ring member as exchanged with the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub id: NodeId,
    /// Address other nodes use to reach it.
    pub host: String,
}

impl NodeInfo {
    /// Create a new NodeInfo.
    pub fn new(id: NodeId, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
        }
    }
}

/// Collect gateway node records into a host map, dropping `exclude`.
pub fn host_map_from_nodes(
    nodes: impl IntoIterator<Item = NodeInfo>,
    exclude: Option<NodeId>,
) -> HostMap {
    nodes
        .into_iter()
        .filter(|n| Some(n.id) != exclude)
        .map(|n| (n.id, n.host))
        .collect()
}

/// Parse a peer hint list of the form `1=host:port,2=host:port`.
pub fn parse_host_list(input: &str) -> Result<HostMap, String> {
    let mut hosts = HostMap::new();
    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, address) = entry
            .split_once('=')
            .ok_or_else(|| format!("peer entry '{}' is not of the form id=host:port", entry))?;
        let id: NodeId = id
            .trim()
            .parse()
            .map_err(|e| format!("invalid node id in '{}': {}", entry, e))?;
        let address = address.trim();
        if address.is_empty() {
            return Err(format!("missing address for node {}", id));
        }
        hosts.insert(id, address.to_string());
    }
    Ok(hosts)
}
