use crate::error::{GatewayError, Result};
use crate::gateway::GatewaySink;
use crate::types::{HostMap, NodeId, Reading};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// A round published by a node.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRound {
    pub sender_id: NodeId,
    pub readings: BTreeMap<NodeId, Reading>,
}

impl PublishedRound {
    pub fn participants(&self) -> BTreeSet<NodeId> {
        self.readings.keys().copied().collect()
    }
}

/// Gateway that keeps everything it receives in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    directory: Mutex<HostMap>,
    rounds: Mutex<Vec<PublishedRound>>,
    memberships: Mutex<Vec<(NodeId, HostMap)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publication fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn rounds(&self) -> Vec<PublishedRound> {
        self.rounds.lock().clone()
    }

    pub fn round_count(&self) -> usize {
        self.rounds.lock().len()
    }

    /// Rounds published after the first `skip` ones.
    pub fn rounds_since(&self, skip: usize) -> Vec<PublishedRound> {
        self.rounds.lock().iter().skip(skip).cloned().collect()
    }

    pub fn memberships(&self) -> Vec<(NodeId, HostMap)> {
        self.memberships.lock().clone()
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(GatewayError::Status {
                status: 503,
                path: path.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl GatewaySink for RecordingSink {
    async fn join(&self, id: NodeId, address: &str) -> Result<HostMap> {
        self.check("/node/join")?;
        let mut directory = self.directory.lock();
        let mut others = directory.clone();
        others.remove(&id);
        directory.insert(id, address.to_string());
        Ok(others)
    }

    async fn publish_readings(
        &self,
        sender_id: NodeId,
        readings: &BTreeMap<NodeId, Reading>,
    ) -> Result<()> {
        self.check("/node/publishNewAverage")?;
        self.rounds.lock().push(PublishedRound {
            sender_id,
            readings: readings.clone(),
        });
        Ok(())
    }

    async fn publish_membership(&self, sender_id: NodeId, hosts: &HostMap) -> Result<()> {
        self.check("/node/publishNewHosts")?;
        self.memberships.lock().push((sender_id, hosts.clone()));
        Ok(())
    }
}
