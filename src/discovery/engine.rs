//! Ring leader election that also agrees on membership.
//!
//! A Chang–Roberts election where every token collects the members it passes
//! through. The highest id on the ring becomes leader; when its own token
//! comes back the membership is final and a `Discovered` token announces it
//! around the ring once more.

use crate::discovery::token::{DiscoveryToken, DiscoveryTokenKind};
use crate::types::{HostMap, NodeId};
use tracing::{debug, trace};

/// Whether a node takes part in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticipationState {
    #[default]
    NotParticipating,
    ParticipatingNormal,
    /// Participating in a round that must also mint a new sensor token.
    ParticipatingForNewToken,
}

impl ParticipationState {
    fn participating(generate_new_token: bool) -> Self {
        if generate_new_token {
            Self::ParticipatingForNewToken
        } else {
            Self::ParticipatingNormal
        }
    }

    /// Whether a round is in progress.
    pub fn is_participating(self) -> bool {
        self != Self::NotParticipating
    }

    /// Whether the current round owes a new sensor token.
    pub fn wants_new_token(self) -> bool {
        self == Self::ParticipatingForNewToken
    }
}

/// Something the node must act on after a discovery step.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Membership the token saw so far; may only be merged into the local view.
    Provisional(HostMap),
    /// Final membership of the round.
    Settled(HostMap),
    /// The leader's announcement went all around the ring.
    LeaderConfirmed {
        hosts: HostMap,
        generate_new_token: bool,
    },
}

/// Outcome of handling a discovery token.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryStep {
    /// Token to hand to the ring successor.
    pub forward: Option<DiscoveryToken>,
    /// Whether more discovery traffic should reach this node.
    pub expect_more: bool,
    pub event: Option<DiscoveryEvent>,
}

impl DiscoveryStep {
    fn forward(token: DiscoveryToken, expect_more: bool, event: Option<DiscoveryEvent>) -> Self {
        Self {
            forward: Some(token),
            expect_more,
            event,
        }
    }

    fn discard(expect_more: bool, event: Option<DiscoveryEvent>) -> Self {
        Self {
            forward: None,
            expect_more,
            event,
        }
    }
}

/// Per-node election state machine.
///
/// Not thread safe; the owner serializes access.
#[derive(Debug)]
pub struct DiscoveryEngine {
    my_id: NodeId,
    my_address: String,
    state: ParticipationState,
}

impl DiscoveryEngine {
    pub fn new(my_id: NodeId, my_address: impl Into<String>) -> Self {
        Self {
            my_id,
            my_address: my_address.into(),
            state: ParticipationState::NotParticipating,
        }
    }

    /// Current participation state.
    pub fn state(&self) -> ParticipationState {
        self.state
    }

    pub fn is_discovering(&self) -> bool {
        self.state.is_participating()
    }

    /// Whether the running round owes a new sensor token.
    pub fn wants_new_token(&self) -> bool {
        self.state.wants_new_token()
    }

    /// Run `action` only while a round is in progress.
    pub fn run_if_discovering(&self, action: impl FnOnce()) -> bool {
        if self.is_discovering() {
            action();
            true
        } else {
            false
        }
    }

    /// Forget any running round.
    pub fn reset(&mut self) {
        self.state = ParticipationState::NotParticipating;
    }

    /// Open a round led by this node.
    ///
    /// A pending request for a new sensor token is never dropped by a later
    /// ordinary round.
    pub fn start_discovery(
        &mut self,
        prior_known_hosts: &HostMap,
        want_new_sensor_token: bool,
    ) -> DiscoveryToken {
        let generate = want_new_sensor_token || self.state.wants_new_token();
        self.state = ParticipationState::participating(generate);

        let mut known_hosts = HostMap::new();
        known_hosts.insert(self.my_id, self.my_address.clone());
        let mut previous_known_hosts = prior_known_hosts.clone();
        previous_known_hosts.insert(self.my_id, self.my_address.clone());

        debug!(
            node_id = self.my_id,
            generate_new_token = generate,
            "Starting discovery"
        );

        DiscoveryToken::initial(self.my_id, known_hosts, previous_known_hosts, generate)
    }

    /// Apply one received token.
    pub fn on_received_discovery(
        &mut self,
        token: &DiscoveryToken,
        has_unseen_hosts: bool,
        local_hosts: &HostMap,
    ) -> DiscoveryStep {
        trace!(
            node_id = self.my_id,
            leader = token.leader,
            kind = ?token.kind,
            state = ?self.state,
            "Received discovery token"
        );

        match token.kind {
            DiscoveryTokenKind::Discovery => {
                self.on_discovery(token, has_unseen_hosts, local_hosts)
            }
            DiscoveryTokenKind::Discovered => self.on_discovered(token),
        }
    }

    fn on_discovery(
        &mut self,
        token: &DiscoveryToken,
        has_unseen_hosts: bool,
        local_hosts: &HostMap,
    ) -> DiscoveryStep {
        let provisional = Some(DiscoveryEvent::Provisional(
            token.previous_known_hosts.clone(),
        ));

        if token.leader > self.my_id {
            self.state = ParticipationState::participating(token.generate_new_sensor_token);
            let next = token.visited_by(self.my_id, &self.my_address, local_hosts);
            return DiscoveryStep::forward(next, true, provisional);
        }

        if token.leader < self.my_id {
            let upgrade = token.generate_new_sensor_token
                && self.state == ParticipationState::ParticipatingNormal;

            if !self.state.is_participating() || has_unseen_hosts || upgrade {
                let generate = token.generate_new_sensor_token || self.state.wants_new_token();
                self.state = ParticipationState::participating(generate);
                let next = token
                    .visited_by(self.my_id, &self.my_address, local_hosts)
                    .led_by(self.my_id)
                    .requesting_new_token(generate);
                return DiscoveryStep::forward(next, true, provisional);
            }

            debug!(
                node_id = self.my_id,
                leader = token.leader,
                "Discarding discovery token with lower leader, already participating"
            );
            return DiscoveryStep::discard(true, provisional);
        }

        if self.state.wants_new_token() && !token.generate_new_sensor_token {
            debug!(
                node_id = self.my_id,
                "Discarding stale discovery round, waiting for the new token round"
            );
            return DiscoveryStep::discard(true, None);
        }

        let discovered = token
            .visited_by(self.my_id, &self.my_address, local_hosts)
            .into_discovered();
        self.state = ParticipationState::NotParticipating;

        debug!(
            node_id = self.my_id,
            members = ?discovered.known_hosts.keys().collect::<Vec<_>>(),
            "Discovery completed, announcing membership"
        );

        let settled = DiscoveryEvent::Settled(discovered.known_hosts.clone());
        DiscoveryStep::forward(discovered, false, Some(settled))
    }

    fn on_discovered(&mut self, token: &DiscoveryToken) -> DiscoveryStep {
        if token.leader == self.my_id {
            debug!(node_id = self.my_id, "Membership announcement returned to leader");
            return DiscoveryStep::discard(
                false,
                Some(DiscoveryEvent::LeaderConfirmed {
                    hosts: token.known_hosts.clone(),
                    generate_new_token: token.generate_new_sensor_token,
                }),
            );
        }

        self.state = ParticipationState::NotParticipating;
        let settled = DiscoveryEvent::Settled(token.known_hosts.clone());
        DiscoveryStep::forward(token.clone(), false, Some(settled))
    }

    /// Remove a peer proven unreachable from `token`.
    ///
    /// An unreachable leader is replaced by this node so the round can still
    /// terminate.
    pub fn fix_token_for_unreachable_peer(
        &self,
        token: &DiscoveryToken,
        unreachable_id: NodeId,
    ) -> DiscoveryToken {
        let fixed = token.without(unreachable_id);
        if token.leader == unreachable_id {
            debug!(
                node_id = self.my_id,
                unreachable = unreachable_id,
                "Unreachable leader replaced by this node"
            );
            fixed.led_by(self.my_id)
        } else {
            fixed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeSet, VecDeque};

    fn address(id: NodeId) -> String {
        format!("localhost:{}", 8079 + id)
    }

    fn full_map(ids: &[NodeId]) -> HostMap {
        ids.iter().map(|id| (*id, address(*id))).collect()
    }

    /// A ring of engines in ascending id order with per-link FIFO queues.
    struct SimRing {
        ids: Vec<NodeId>,
        engines: Vec<DiscoveryEngine>,
        /// `links[i]` holds tokens in flight from node `i` to node `i + 1`.
        links: Vec<VecDeque<DiscoveryToken>>,
        /// Each node's local membership view.
        views: Vec<HostMap>,
        settled: Vec<Vec<HostMap>>,
        confirmations: Vec<(NodeId, bool)>,
        completions: BTreeSet<NodeId>,
    }

    impl SimRing {
        /// Ring where every node already knows every member.
        fn new(ids: &[NodeId]) -> Self {
            let full = full_map(ids);
            Self::with_views(ids, |_| full.clone())
        }

        /// Ring where node `i` (in ascending order) starts from `view(i)` plus itself.
        fn with_views(ids: &[NodeId], view: impl Fn(usize) -> HostMap) -> Self {
            let mut ids = ids.to_vec();
            ids.sort_unstable();
            let views = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let mut hosts = view(i);
                    hosts.insert(*id, address(*id));
                    hosts
                })
                .collect();
            Self {
                views,
                engines: ids
                    .iter()
                    .map(|id| DiscoveryEngine::new(*id, address(*id)))
                    .collect(),
                links: vec![VecDeque::new(); ids.len()],
                settled: vec![Vec::new(); ids.len()],
                confirmations: Vec::new(),
                completions: BTreeSet::new(),
                ids,
            }
        }

        fn start(&mut self, index: usize, want_new: bool) {
            let token = self.engines[index].start_discovery(&self.views[index], want_new);
            self.links[index].push_back(token);
        }

        /// Deliver tokens in the order picked by `schedule` until the ring is quiet.
        fn run(&mut self, schedule: Vec<proptest::sample::Index>) -> bool {
            let mut schedule = schedule.into_iter();
            for _ in 0..20_000 {
                if !self.in_flight() {
                    return true;
                }
                let busy: Vec<usize> = (0..self.ids.len())
                    .filter(|i| !self.links[*i].is_empty())
                    .collect();
                let pick = match schedule.next() {
                    Some(index) => busy[index.index(busy.len())],
                    None => busy[0],
                };
                self.deliver(pick);
            }
            false
        }

        fn in_flight(&self) -> bool {
            self.links.iter().any(|l| !l.is_empty())
        }

        /// Deliver the head of link `from` to its successor.
        fn deliver(&mut self, from: usize) {
            let Some(token) = self.links[from].pop_front() else {
                return;
            };
            let to = (from + 1) % self.ids.len();
            let has_unseen_hosts = token
                .known_hosts
                .keys()
                .any(|id| !self.views[to].contains_key(id));
            let step = self.engines[to].on_received_discovery(&token, has_unseen_hosts, &self.views[to]);

            if token.is_discovery() && token.leader == self.ids[to] {
                if let Some(next) = &step.forward {
                    assert_eq!(next.kind, DiscoveryTokenKind::Discovered);
                    self.completions.insert(self.ids[to]);
                }
            }
            match step.event {
                Some(DiscoveryEvent::Provisional(hosts)) => {
                    for (id, host) in hosts {
                        self.views[to].entry(id).or_insert(host);
                    }
                }
                Some(DiscoveryEvent::Settled(hosts)) => {
                    self.views[to] = hosts.clone();
                    self.settled[to].push(hosts);
                }
                Some(DiscoveryEvent::LeaderConfirmed {
                    generate_new_token, ..
                }) => self.confirmations.push((self.ids[to], generate_new_token)),
                _ => {}
            }
            if let Some(next) = step.forward {
                self.links[to].push_back(next);
            }
        }
    }

    #[test]
    fn test_four_nodes_from_every_start() {
        let expected = full_map(&[1, 2, 3, 4]);
        assert_eq!(expected[&1], "localhost:8080");
        assert_eq!(expected[&4], "localhost:8083");

        for start in 0..4 {
            let mut ring = SimRing::new(&[1, 2, 3, 4]);
            ring.start(start, false);

            let mut hop = start;
            let mut steps = 0;
            while ring.in_flight() {
                ring.deliver(hop);
                hop = (hop + 1) % 4;
                steps += 1;
                assert!(steps < 64, "discovery did not terminate");
            }

            for (i, settled) in ring.settled.iter().enumerate() {
                assert_eq!(settled.last(), Some(&expected), "node index {}", i);
            }
            assert_eq!(ring.completions, BTreeSet::from([4]));
            assert_eq!(ring.confirmations, vec![(4, false)]);
            assert!(ring.engines.iter().all(|e| !e.is_discovering()));
        }
    }

    #[test]
    fn test_lower_leader_discarded_while_participating() {
        let mut engine = DiscoveryEngine::new(3, address(3));
        engine.start_discovery(&HostMap::new(), false);

        let lower = DiscoveryToken::initial(1, full_map(&[1]), full_map(&[1]), false);
        let step = engine.on_received_discovery(&lower, false, &HostMap::new());
        assert!(step.forward.is_none());
        assert!(step.expect_more);

        // Unknown members force the token through anyway.
        let step = engine.on_received_discovery(&lower, true, &HostMap::new());
        assert_eq!(step.forward.map(|t| t.leader), Some(3));
    }

    #[test]
    fn test_new_token_request_upgrades_in_place() {
        let mut engine = DiscoveryEngine::new(3, address(3));
        engine.start_discovery(&HostMap::new(), false);
        assert_eq!(engine.state(), ParticipationState::ParticipatingNormal);

        let request = DiscoveryToken::initial(1, full_map(&[1]), full_map(&[1]), true);
        let step = engine.on_received_discovery(&request, false, &HostMap::new());
        let forwarded = step.forward.unwrap();
        assert_eq!(forwarded.leader, 3);
        assert!(forwarded.generate_new_sensor_token);
        assert!(engine.wants_new_token());

        // A second request is a duplicate now.
        let step = engine.on_received_discovery(&request, false, &HostMap::new());
        assert!(step.forward.is_none());
    }

    #[test]
    fn test_start_discovery_never_downgrades() {
        let mut engine = DiscoveryEngine::new(2, address(2));
        assert!(engine.start_discovery(&HostMap::new(), true).generate_new_sensor_token);
        let token = engine.start_discovery(&full_map(&[1, 3]), false);
        assert!(token.generate_new_sensor_token);
        assert_eq!(token.previous_known_hosts, full_map(&[1, 2, 3]));
        assert_eq!(token.known_hosts, full_map(&[2]));
    }

    #[test]
    fn test_stale_round_discarded_by_new_token_leader() {
        let mut engine = DiscoveryEngine::new(5, address(5));
        engine.start_discovery(&HostMap::new(), true);

        let stale = DiscoveryToken::initial(5, full_map(&[5, 1]), full_map(&[5, 1]), false);
        let step = engine.on_received_discovery(&stale, false, &HostMap::new());
        assert!(step.forward.is_none());
        assert!(step.expect_more);
        assert!(engine.is_discovering());

        let fresh = stale.clone().requesting_new_token(true);
        let step = engine.on_received_discovery(&fresh, false, &HostMap::new());
        assert_eq!(
            step.event,
            Some(DiscoveryEvent::Settled(full_map(&[1, 5])))
        );
        assert!(!step.expect_more);
        assert!(!engine.is_discovering());
    }

    #[test]
    fn test_fix_token_for_unreachable_leader() {
        let engine = DiscoveryEngine::new(2, address(2));
        let token = DiscoveryToken::initial(4, full_map(&[4, 1]), full_map(&[1, 2, 3, 4]), false);

        let fixed = engine.fix_token_for_unreachable_peer(&token, 4);
        assert_eq!(fixed.leader, 2);
        assert_eq!(fixed.known_hosts, full_map(&[1]));
        assert_eq!(fixed.previous_known_hosts, full_map(&[1, 2, 3]));

        let fixed = engine.fix_token_for_unreachable_peer(&token, 3);
        assert_eq!(fixed.leader, 4);
    }

    #[test]
    fn test_run_if_discovering() {
        let mut engine = DiscoveryEngine::new(1, address(1));
        let mut ran = false;
        assert!(!engine.run_if_discovering(|| ran = true));
        assert!(!ran);

        engine.start_discovery(&HostMap::new(), false);
        assert!(engine.run_if_discovering(|| ran = true));
        assert!(ran);

        engine.reset();
        assert!(!engine.is_discovering());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn concurrent_rounds_elect_a_single_leader(
            ids in proptest::collection::btree_set(1u64..500, 2..9),
            initiators in proptest::collection::vec((any::<proptest::sample::Index>(), any::<bool>()), 1..5),
            schedule in proptest::collection::vec(any::<proptest::sample::Index>(), 0..2000),
        ) {
            let ids: Vec<NodeId> = ids.into_iter().collect();
            let max_id = *ids.last().unwrap();
            let mut ring = SimRing::new(&ids);

            let mut any_new_token = false;
            for (who, want_new) in &initiators {
                ring.start(who.index(ids.len()), *want_new);
                any_new_token |= *want_new;
            }

            prop_assert!(ring.run(schedule), "discovery did not terminate");

            let expected = full_map(&ids);
            prop_assert_eq!(ring.completions.clone(), BTreeSet::from([max_id]));
            for settled in &ring.settled {
                prop_assert_eq!(settled.last(), Some(&expected));
            }
            prop_assert!(!ring.confirmations.is_empty());
            prop_assert!(ring.confirmations.iter().all(|(leader, _)| *leader == max_id));
            prop_assert_eq!(
                ring.confirmations.iter().any(|(_, new_token)| *new_token),
                any_new_token
            );
            prop_assert!(ring.engines.iter().all(|e| !e.is_discovering()));
        }

        #[test]
        fn partial_views_converge_on_full_membership(
            ids in proptest::collection::btree_set(1u64..500, 2..9),
            knows in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 8), 8),
            initiators in proptest::collection::vec((any::<proptest::sample::Index>(), any::<bool>()), 1..5),
            schedule in proptest::collection::vec(any::<proptest::sample::Index>(), 0..2000),
        ) {
            let ids: Vec<NodeId> = ids.into_iter().collect();
            let max_id = *ids.last().unwrap();
            let mut ring = SimRing::with_views(&ids, |i| {
                let known: Vec<NodeId> = ids
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| knows[i][*j])
                    .map(|(_, id)| *id)
                    .collect();
                full_map(&known)
            });

            for (who, want_new) in &initiators {
                ring.start(who.index(ids.len()), *want_new);
            }
            prop_assert!(ring.run(schedule), "discovery did not terminate");

            let expected = full_map(&ids);
            prop_assert_eq!(ring.completions.clone(), BTreeSet::from([max_id]));
            for (settled, view) in ring.settled.iter().zip(&ring.views) {
                prop_assert_eq!(settled.last(), Some(&expected));
                prop_assert_eq!(view, &expected);
            }
            prop_assert!(ring.confirmations.iter().all(|(leader, _)| *leader == max_id));
            prop_assert!(ring.engines.iter().all(|e| !e.is_discovering()));
        }
    }
}
