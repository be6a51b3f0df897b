//! Protocol orchestration for one ring node.
//!
//! The controller applies every inbound token under the relevant lock and
//! answers the caller right away. Outbound tokens go through one queue per
//! stream, drained by a dispatch task, so a slow or dead successor never
//! blocks the RPC path or the other stream.
//!
//! Lock order: `discovery` before `on_hold`, `discovery` before topology.
//! No lock is held across a network call.

use crate::acquisition::{SensorReadingsToken, SlidingWindowReducer, TokenCirculationEngine};
use crate::config::{NodeConfig, TimeoutConfig};
use crate::discovery::{DiscoveryEngine, DiscoveryEvent, DiscoveryToken};
use crate::error::{Result, RingError};
use crate::gateway::GatewaySink;
use crate::metrics::{NodeMetrics, NodeMetricsSnapshot};
use crate::network::{Message, MessageHandler, NewNeighbour, PeerConnector};
use crate::ring::{Neighbour, RingTopology};
use crate::timer::{TimeoutKind, TimeoutScheduler};
use crate::types::{HostMap, NodeId, Reading};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Orchestrates topology, discovery, token circulation and timeouts.
pub struct NodeController {
    my_id: NodeId,
    my_address: String,
    hop_delay: Option<Duration>,
    timeouts: TimeoutConfig,

    topology: RingTopology,
    discovery: Mutex<DiscoveryEngine>,
    circulation: TokenCirculationEngine,
    /// Sensor token parked while a discovery round runs.
    on_hold: Mutex<Option<SensorReadingsToken>>,
    /// Serializes sensor token processing.
    sensor_step: Mutex<()>,
    last_sensor_seen: Mutex<Option<Instant>>,

    timers: TimeoutScheduler,
    sink: Arc<dyn GatewaySink>,
    metrics: Arc<NodeMetrics>,

    sensor_tx: mpsc::UnboundedSender<SensorReadingsToken>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl NodeController {
    /// Create a controller and start its dispatch tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &NodeConfig,
        connector: Arc<dyn PeerConnector>,
        reducer: Arc<SlidingWindowReducer>,
        sink: Arc<dyn GatewaySink>,
    ) -> Arc<Self> {
        let (sensor_tx, sensor_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();

        let topology = RingTopology::new(
            config.node_id,
            config.address.clone(),
            connector,
            &config.initial_hosts,
        );
        let metrics = Arc::new(NodeMetrics::new());
        metrics.ring_size.set(topology.known_ids().len() as u64);

        let controller = Arc::new(Self {
            my_id: config.node_id,
            my_address: config.address.clone(),
            hop_delay: config.hop_delay,
            timeouts: config.timeouts.clone(),
            topology,
            discovery: Mutex::new(DiscoveryEngine::new(config.node_id, config.address.clone())),
            circulation: TokenCirculationEngine::new(config.node_id, reducer),
            on_hold: Mutex::new(None),
            sensor_step: Mutex::new(()),
            last_sensor_seen: Mutex::new(None),
            timers: TimeoutScheduler::new(config.node_id),
            sink,
            metrics,
            sensor_tx,
            discovery_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&controller);
        let handles = vec![
            tokio::spawn(Self::sensor_dispatch_loop(weak.clone(), sensor_rx)),
            tokio::spawn(Self::discovery_dispatch_loop(weak, discovery_rx)),
        ];
        *controller.tasks.lock() = handles;

        info!(
            node_id = controller.my_id,
            address = %controller.my_address,
            ring = ?controller.topology.ring_order(),
            "Node controller created"
        );
        controller
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.my_id
    }

    pub fn topology(&self) -> &RingTopology {
        &self.topology
    }

    /// Current known membership, self included.
    pub fn known_hosts(&self) -> HostMap {
        self.topology.known_hosts()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.lock().is_discovering()
    }

    /// Whether a sensor token is parked on this node.
    pub fn holds_sensor_token(&self) -> bool {
        self.on_hold.lock().is_some()
    }

    pub fn metrics(&self) -> NodeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> Arc<NodeMetrics> {
        self.metrics.clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Announce this node to its ring predecessor.
    ///
    /// Unresponsive predecessors are skipped. With nobody answering the node
    /// is alone and mints the first sensor token generation.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let announcement = Message::NewNeighbour(NewNeighbour {
            id: self.my_id,
            address: self.my_address.clone(),
        });

        let mut skip = 0;
        while let Some(predecessor) = self.topology.predecessor(skip) {
            match self.call(&predecessor, announcement.clone()).await {
                Ok(()) => {
                    info!(
                        node_id = self.my_id,
                        peer_id = predecessor.id,
                        "Announced to ring predecessor"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        node_id = self.my_id,
                        peer_id = predecessor.id,
                        error = %e,
                        "Predecessor did not answer the announcement"
                    );
                    skip += 1;
                }
            }
        }

        info!(node_id = self.my_id, tried = skip, "Alone in the network");
        if skip > 0 {
            self.topology.set_membership(&HostMap::new());
            self.metrics.ring_size.set(1);
        }
        self.mint_token();
        Ok(())
    }

    /// Stop timers and dispatch tasks. Inbound messages are ignored afterwards.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.timers.cancel_all();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(node_id = self.my_id, "Node controller stopped");
    }

    // Sensor token stream

    /// A sensor token arrived from the predecessor.
    pub fn on_sensor_token(self: &Arc<Self>, token: SensorReadingsToken) {
        if self.is_stopped() {
            return;
        }
        self.metrics.sensor_tokens_received.inc();
        debug!(
            node_id = self.my_id,
            generation = %token.generation_id,
            readings = token.last_measurements.len(),
            "Received sensor token"
        );

        if let Some(token) = self.park_if_discovering(token) {
            self.process_sensor_token(token);
        }
    }

    fn park_if_discovering(&self, token: SensorReadingsToken) -> Option<SensorReadingsToken> {
        let mut token = Some(token);
        let engine = self.discovery.lock();
        let parked = engine.run_if_discovering(|| {
            if let Some(token) = token.take() {
                self.hold(token);
            }
        });
        if parked {
            info!(node_id = self.my_id, "Discovery in progress, sensor token on hold");
        }
        token
    }

    fn hold(&self, token: SensorReadingsToken) {
        let mut slot = self.on_hold.lock();
        match slot.as_ref() {
            Some(held) if held.generation_id != token.generation_id => {
                debug!(
                    node_id = self.my_id,
                    kept = %held.generation_id,
                    dropped = %token.generation_id,
                    "Already holding a sensor token, dropping the other generation"
                );
            }
            _ => {
                *slot = Some(token);
                self.metrics.sensor_tokens_held.inc();
            }
        }
    }

    /// Merge the local reading and queue the result for the successor.
    fn process_sensor_token(self: &Arc<Self>, token: SensorReadingsToken) {
        let circulation = {
            let _step = self.sensor_step.lock();
            let known = self.topology.known_ids();
            let Some(circulation) = self.circulation.merge_and_check_completion(token, &known)
            else {
                self.metrics.sensor_tokens_duplicate.inc();
                return;
            };
            self.timers.cancel(TimeoutKind::Sensor);
            *self.last_sensor_seen.lock() = Some(Instant::now());
            circulation
        };

        if let Some(round) = circulation.completed {
            self.metrics.sensor_rounds_completed.inc();
            info!(
                node_id = self.my_id,
                generation = %round.generation_id,
                nodes = ?round.readings.keys().collect::<Vec<_>>(),
                "Sensor round complete, publishing readings"
            );
            self.publish_readings(round.readings);
        }

        self.enqueue_sensor(circulation.token);
    }

    fn enqueue_sensor(&self, token: SensorReadingsToken) {
        if self.sensor_tx.send(token).is_err() {
            debug!(node_id = self.my_id, "Sensor dispatch stopped, token dropped");
        }
    }

    fn mint_token(self: &Arc<Self>) {
        let token = SensorReadingsToken::mint();
        self.metrics.sensor_tokens_minted.inc();
        info!(
            node_id = self.my_id,
            generation = %token.generation_id,
            "Minted new sensor token generation"
        );
        self.process_sensor_token(token);
    }

    fn seen_sensor_token_recently(&self) -> bool {
        let window = self
            .sensor_timeout()
            .unwrap_or(self.timeouts.solo_recirculation + self.hop_delay.unwrap_or_default())
            * 2;
        self.last_sensor_seen
            .lock()
            .map(|seen| seen.elapsed() < window)
            .unwrap_or(false)
    }

    fn publish_readings(self: &Arc<Self>, readings: BTreeMap<NodeId, Reading>) {
        if !readings.is_empty() {
            let sum: f64 = readings.values().sum();
            self.metrics
                .last_round_average
                .set(sum / readings.len() as f64);
        }

        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let node_id = self.my_id;
        tokio::spawn(async move {
            if let Err(e) = sink.publish_readings(node_id, &readings).await {
                metrics.publish_failures.inc();
                warn!(node_id, error = %e, "Failed to publish readings");
            }
        });
    }

    async fn sensor_dispatch_loop(
        weak: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<SensorReadingsToken>,
    ) {
        while let Some(token) = rx.recv().await {
            let Some(this) = weak.upgrade() else {
                break;
            };
            this.dispatch_sensor(token).await;
        }
    }

    async fn dispatch_sensor(self: &Arc<Self>, token: SensorReadingsToken) {
        if let Some(delay) = self.hop_delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_stopped() {
            return;
        }
        let Some(token) = self.park_if_discovering(token) else {
            return;
        };

        let Some(successor) = self.topology.successor(0) else {
            // Alone: keep the token going so local readings are still published.
            tokio::time::sleep(self.timeouts.solo_recirculation).await;
            if !self.is_stopped() {
                self.process_sensor_token(token);
            }
            return;
        };

        match self
            .call(&successor, Message::SensorReadings(token.clone()))
            .await
        {
            Ok(()) => {
                self.metrics.sensor_tokens_forwarded.inc();
                debug!(
                    node_id = self.my_id,
                    peer_id = successor.id,
                    generation = %token.generation_id,
                    "Sensor token forwarded"
                );
                self.arm_sensor_timeout();
            }
            Err(e) => {
                warn!(
                    node_id = self.my_id,
                    peer_id = successor.id,
                    error = %e,
                    "Successor unreachable, holding sensor token and rediscovering"
                );
                self.metrics.unreachable_peers_skipped.inc();
                self.hold(token);
                self.start_discovery(Some(successor.id), false);
            }
        }
    }

    // Discovery stream

    /// A discovery token arrived from the predecessor.
    pub fn on_discovery_token(self: &Arc<Self>, token: DiscoveryToken) {
        if self.is_stopped() {
            return;
        }
        let local_hosts = self.topology.known_hosts();
        let has_unseen_hosts = self.topology.has_unseen_hosts(&token.known_hosts);

        let mut released = None;
        let step = {
            let mut engine = self.discovery.lock();
            let step = engine.on_received_discovery(&token, has_unseen_hosts, &local_hosts);
            match &step.event {
                Some(DiscoveryEvent::Provisional(hosts)) => {
                    for (id, address) in hosts {
                        if !local_hosts.contains_key(id) {
                            self.topology.insert(*id, address.clone());
                        }
                    }
                }
                Some(DiscoveryEvent::Settled(hosts)) => {
                    self.topology.set_membership(hosts);
                    released = self.on_hold.lock().take();
                }
                _ => {}
            }
            step
        };

        if step.forward.is_none() && step.expect_more {
            self.metrics.discovery_tokens_discarded.inc();
        }

        if step.expect_more {
            self.arm_discovery_timeout();
        } else {
            self.timers.cancel(TimeoutKind::Discovery);
        }

        match step.event {
            Some(DiscoveryEvent::Settled(hosts)) => {
                self.metrics.discovery_rounds_completed.inc();
                self.metrics.ring_size.set(self.topology.known_ids().len() as u64);
                info!(
                    node_id = self.my_id,
                    leader = token.leader,
                    members = ?hosts.keys().collect::<Vec<_>>(),
                    "Membership settled"
                );
                match released {
                    Some(held) => self.process_sensor_token(held),
                    None => self.arm_sensor_timeout(),
                }
            }
            Some(DiscoveryEvent::LeaderConfirmed {
                hosts,
                generate_new_token,
            }) => self.on_leader_confirmed(hosts, generate_new_token),
            _ => {}
        }

        if let Some(next) = step.forward {
            self.enqueue_discovery(next);
        }
    }

    fn on_leader_confirmed(self: &Arc<Self>, hosts: HostMap, generate_new_token: bool) {
        info!(
            node_id = self.my_id,
            members = ?hosts.keys().collect::<Vec<_>>(),
            generate_new_token,
            "Discovery confirmed by the whole ring"
        );

        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let node_id = self.my_id;
        tokio::spawn(async move {
            if let Err(e) = sink.publish_membership(node_id, &hosts).await {
                metrics.publish_failures.inc();
                warn!(node_id, error = %e, "Failed to publish membership");
            }
        });

        let alone = self.topology.neighbour_count() == 0;
        if (generate_new_token || alone)
            && !self.holds_sensor_token()
            && !self.seen_sensor_token_recently()
        {
            self.mint_token();
        }
    }

    /// A node announced itself as our new successor.
    pub fn on_new_neighbour(self: &Arc<Self>, id: NodeId, address: String) {
        if self.is_stopped() {
            return;
        }
        info!(node_id = self.my_id, peer_id = id, %address, "New neighbour announced");
        self.topology.insert(id, address);
        self.start_discovery(None, false);
    }

    /// Open a discovery round led by this node.
    pub fn start_discovery(self: &Arc<Self>, exclude: Option<NodeId>, want_new_token: bool) {
        if let Some(id) = exclude {
            self.topology.remove(id);
        }
        let prior = self.topology.known_hosts();
        let token = self.discovery.lock().start_discovery(&prior, want_new_token);
        self.metrics.discovery_rounds_started.inc();

        self.arm_discovery_timeout();
        self.enqueue_discovery(token);
    }

    fn enqueue_discovery(&self, token: DiscoveryToken) {
        if self.discovery_tx.send(token).is_err() {
            debug!(node_id = self.my_id, "Discovery dispatch stopped, token dropped");
        }
    }

    async fn discovery_dispatch_loop(
        weak: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<DiscoveryToken>,
    ) {
        while let Some(token) = rx.recv().await {
            let Some(this) = weak.upgrade() else {
                break;
            };
            if let Err(e) = this.dispatch_discovery(token).await {
                error!(node_id = this.my_id, error = %e, "Discovery dispatch failed");
            }
        }
    }

    /// Hand `token` to the first successor that answers.
    async fn dispatch_discovery(self: &Arc<Self>, token: DiscoveryToken) -> Result<()> {
        if let Some(delay) = self.hop_delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_stopped() {
            return Ok(());
        }

        let mut token = token;
        let mut skip = 0;
        while let Some(successor) = self.topology.successor(skip) {
            match self.call(&successor, Message::Discovery(token.clone())).await {
                Ok(()) => {
                    debug!(
                        node_id = self.my_id,
                        peer_id = successor.id,
                        leader = token.leader,
                        kind = ?token.kind,
                        "Discovery token passed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        node_id = self.my_id,
                        peer_id = successor.id,
                        skip,
                        error = %e,
                        "Skipping unreachable successor"
                    );
                    self.metrics.unreachable_peers_skipped.inc();
                    let fixed = self
                        .discovery
                        .lock()
                        .fix_token_for_unreachable_peer(&token, successor.id);
                    token = fixed;
                    skip += 1;
                }
            }
        }

        if skip == 0 {
            // Ring of one: the token comes straight back.
            self.on_discovery_token(token);
            return Ok(());
        }

        self.become_isolated();
        Err(RingError::Isolated {
            node_id: self.my_id,
            tried: skip,
        }
        .into())
    }

    fn become_isolated(self: &Arc<Self>) {
        self.discovery.lock().reset();
        self.timers.cancel_all();
        self.topology.set_membership(&HostMap::new());
        self.metrics.ring_size.set(1);

        let held = self.on_hold.lock().take();
        match held {
            Some(token) => self.process_sensor_token(token),
            None if !self.seen_sensor_token_recently() => self.mint_token(),
            None => {}
        }
        self.metrics.isolations.inc();
    }

    // Timeouts

    /// Time for a sensor token to go around the ring.
    fn sensor_timeout(&self) -> Option<Duration> {
        let neighbours = self.topology.neighbour_count() as u32;
        if neighbours == 0 {
            return None;
        }
        let per_hop = self.timeouts.per_hop + self.hop_delay.unwrap_or_default();
        Some(per_hop * neighbours)
    }

    /// A discovery round needs two laps.
    fn discovery_timeout(&self) -> Option<Duration> {
        self.sensor_timeout().map(|t| t * 2)
    }

    fn arm_sensor_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers.schedule_unless(
            TimeoutKind::Sensor,
            self.sensor_timeout(),
            &[TimeoutKind::Discovery],
            async move {
                if let Some(this) = weak.upgrade() {
                    this.on_sensor_timeout();
                }
            },
        );
    }

    fn arm_discovery_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timers.schedule_exclusive(
            TimeoutKind::Discovery,
            self.discovery_timeout(),
            async move {
                if let Some(this) = weak.upgrade() {
                    this.on_discovery_timeout();
                }
            },
        );
    }

    fn on_sensor_timeout(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        self.metrics.timeouts_fired.inc();
        warn!(
            node_id = self.my_id,
            "Sensor token did not come back, rediscovering to replace it"
        );
        self.start_discovery(None, true);
    }

    fn on_discovery_timeout(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        self.metrics.timeouts_fired.inc();
        warn!(node_id = self.my_id, "Discovery round timed out, restarting");
        self.start_discovery(None, false);
    }

    async fn call(&self, peer: &Neighbour, msg: Message) -> Result<()> {
        match peer.link.call(msg).await? {
            Message::Ack => Ok(()),
            other => Err(RingError::UnexpectedReply {
                peer_id: peer.id,
                reply: other.kind().to_string(),
            }
            .into()),
        }
    }
}

impl Drop for NodeController {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Routes inbound ring messages to the controller.
pub struct RingMessageHandler {
    controller: Arc<NodeController>,
}

impl RingMessageHandler {
    pub fn new(controller: Arc<NodeController>) -> Self {
        Self { controller }
    }
}

impl MessageHandler for RingMessageHandler {
    fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::SensorReadings(token) => self.controller.on_sensor_token(token),
            Message::Discovery(token) => self.controller.on_discovery_token(token),
            Message::NewNeighbour(announcement) => self
                .controller
                .on_new_neighbour(announcement.id, announcement.address),
            Message::Ack => return None,
        }
        Some(Message::Ack)
    }
}
