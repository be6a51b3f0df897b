//! Discovery token exchanged during an election round.

use crate::types::{HostMap, NodeId};
use serde::{Deserialize, Serialize};

/// Phase of a discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryTokenKind {
    /// Membership is still being collected.
    Discovery,
    /// The leader announced the final membership.
    Discovered,
}

/// Election and membership token.
///
/// Tokens are values: every step of the protocol produces a new token and a
/// token handed to the transport is never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryToken {
    pub kind: DiscoveryTokenKind,
    /// Provisional (or, once discovered, final) leader.
    pub leader: NodeId,
    /// Members that handled this token during the round.
    pub known_hosts: HostMap,
    /// Membership as known by the nodes the token went through.
    pub previous_known_hosts: HostMap,
    /// Whether the round must also regenerate the sensor token.
    pub generate_new_sensor_token: bool,
}

impl DiscoveryToken {
    /// Token that opens a new round.
    pub fn initial(
        leader: NodeId,
        known_hosts: HostMap,
        previous_known_hosts: HostMap,
        generate_new_sensor_token: bool,
    ) -> Self {
        Self {
            kind: DiscoveryTokenKind::Discovery,
            leader,
            known_hosts,
            previous_known_hosts,
            generate_new_sensor_token,
        }
    }

    /// Whether the round is still collecting members.
    pub fn is_discovery(&self) -> bool {
        self.kind == DiscoveryTokenKind::Discovery
    }

    /// Copy with `id` added to the members and `local_hosts` merged into the
    /// previously known membership.
    pub fn visited_by(&self, id: NodeId, address: &str, local_hosts: &HostMap) -> Self {
        let mut next = self.clone();
        next.known_hosts.insert(id, address.to_string());
        for (host_id, host) in local_hosts {
            next.previous_known_hosts
                .entry(*host_id)
                .or_insert_with(|| host.clone());
        }
        next
    }

    /// Copy with a different leader.
    pub fn led_by(mut self, leader: NodeId) -> Self {
        self.leader = leader;
        self
    }

    /// Copy with the new-token request set.
    pub fn requesting_new_token(mut self, generate: bool) -> Self {
        self.generate_new_sensor_token = generate;
        self
    }

    /// Copy announcing the final membership.
    pub fn into_discovered(mut self) -> Self {
        self.kind = DiscoveryTokenKind::Discovered;
        self.previous_known_hosts.clear();
        self
    }

    /// Copy without any trace of `id`.
    pub fn without(&self, id: NodeId) -> Self {
        let mut next = self.clone();
        next.known_hosts.remove(&id);
        next.previous_known_hosts.remove(&id);
        next
    }
}
