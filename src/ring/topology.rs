//! Ring membership and neighbour ordering.

use crate::network::{PeerConnector, PeerLink};
use crate::types::{HostMap, NodeId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Compute the ring order as seen from `my_id`.
///
/// The result starts at the immediate successor of `my_id`, ends at its
/// immediate predecessor and never contains `my_id` itself.
pub fn compute_ring_order(ids: impl IntoIterator<Item = NodeId>, my_id: NodeId) -> Vec<NodeId> {
    let sorted: BTreeSet<NodeId> = ids.into_iter().filter(|id| *id != my_id).collect();
    let (after, before): (Vec<NodeId>, Vec<NodeId>) = sorted.into_iter().partition(|id| *id > my_id);
    after.into_iter().chain(before).collect()
}

/// A ring neighbour with its link.
#[derive(Clone)]
pub struct Neighbour {
    pub id: NodeId,
    pub link: Arc<dyn PeerLink>,
}

impl Neighbour {
    /// Address of the neighbour.
    pub fn address(&self) -> &str {
        self.link.address()
    }
}

impl std::fmt::Debug for Neighbour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neighbour")
            .field("id", &self.id)
            .field("address", &self.address())
            .finish()
    }
}

struct RingState {
    /// All known members, self included.
    hosts: HostMap,
    /// Links to every member but self.
    links: HashMap<NodeId, Arc<dyn PeerLink>>,
    /// Neighbours in ring order starting at the successor.
    ordered: Vec<NodeId>,
}

/// Ring membership of one node.
pub struct RingTopology {
    my_id: NodeId,
    my_address: String,
    connector: Arc<dyn PeerConnector>,
    state: RwLock<RingState>,
}

impl RingTopology {
    /// Create a topology seeded with `initial_hosts`.
    pub fn new(
        my_id: NodeId,
        my_address: impl Into<String>,
        connector: Arc<dyn PeerConnector>,
        initial_hosts: &HostMap,
    ) -> Self {
        let topology = Self {
            my_id,
            my_address: my_address.into(),
            connector,
            state: RwLock::new(RingState {
                hosts: HostMap::new(),
                links: HashMap::new(),
                ordered: Vec::new(),
            }),
        };
        topology.set_membership(initial_hosts);
        topology
    }

    /// This node's id.
    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    /// Replace the whole membership.
    ///
    /// Links whose address is already open are reused; self is always a member.
    pub fn set_membership(&self, hosts: &HostMap) {
        let mut state = self.state.write();

        let mut by_address: HashMap<String, Arc<dyn PeerLink>> = state
            .links
            .drain()
            .map(|(_, link)| (link.address().to_string(), link))
            .collect();

        let mut new_hosts = hosts.clone();
        new_hosts.insert(self.my_id, self.my_address.clone());

        let mut links = HashMap::with_capacity(new_hosts.len());
        for (&id, address) in new_hosts.iter().filter(|(id, _)| **id != self.my_id) {
            let link = match by_address.remove(address) {
                Some(link) => link,
                None => self.connector.connect(address),
            };
            links.insert(id, link);
        }

        state.ordered = compute_ring_order(new_hosts.keys().copied(), self.my_id);
        state.hosts = new_hosts;
        state.links = links;

        debug!(node_id = self.my_id, ring = ?state.ordered, "Membership replaced");
    }

    /// Add one member, keeping every other link untouched.
    pub fn insert(&self, id: NodeId, address: impl Into<String>) {
        if id == self.my_id {
            return;
        }
        let address = address.into();
        let mut state = self.state.write();

        let reusable = state
            .links
            .get(&id)
            .filter(|link| link.address() == address)
            .cloned();
        let link = reusable.unwrap_or_else(|| self.connector.connect(&address));

        state.links.insert(id, link);
        state.hosts.insert(id, address);
        state.ordered = compute_ring_order(state.hosts.keys().copied(), self.my_id);

        debug!(node_id = self.my_id, peer_id = id, ring = ?state.ordered, "Member inserted");
    }

    /// Drop one member.
    pub fn remove(&self, id: NodeId) {
        if id == self.my_id {
            return;
        }
        let mut state = self.state.write();
        if state.hosts.remove(&id).is_some() {
            state.links.remove(&id);
            state.ordered = compute_ring_order(state.hosts.keys().copied(), self.my_id);
            debug!(node_id = self.my_id, peer_id = id, "Member removed");
        }
    }

    /// The `skip`-th next neighbour, without wrapping around.
    pub fn successor(&self, skip: usize) -> Option<Neighbour> {
        let state = self.state.read();
        let id = *state.ordered.get(skip)?;
        Self::neighbour(&state, id)
    }

    /// The `skip`-th previous neighbour, without wrapping around.
    pub fn predecessor(&self, skip: usize) -> Option<Neighbour> {
        let state = self.state.read();
        let index = state.ordered.len().checked_sub(skip + 1)?;
        Self::neighbour(&state, state.ordered[index])
    }

    fn neighbour(state: &RingState, id: NodeId) -> Option<Neighbour> {
        state.links.get(&id).map(|link| Neighbour {
            id,
            link: link.clone(),
        })
    }

    /// Snapshot of all known members, self included.
    pub fn known_hosts(&self) -> HostMap {
        self.state.read().hosts.clone()
    }

    /// Ids of all known members, self included.
    pub fn known_ids(&self) -> BTreeSet<NodeId> {
        self.state.read().hosts.keys().copied().collect()
    }

    /// Neighbours in ring order.
    pub fn ring_order(&self) -> Vec<NodeId> {
        self.state.read().ordered.clone()
    }

    /// Number of members other than self.
    pub fn neighbour_count(&self) -> usize {
        self.state.read().ordered.len()
    }

    /// Whether `hosts` names any member not known locally.
    pub fn has_unseen_hosts(&self, hosts: &HostMap) -> bool {
        let state = self.state.read();
        hosts.keys().any(|id| !state.hosts.contains_key(id))
    }
}
