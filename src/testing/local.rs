//! In-memory transport for ring tests.
//!
//! Nodes register a [`MessageHandler`] under their address. Links deliver
//! messages by calling the handler directly, so a whole ring runs inside one
//! runtime without sockets. Failures are injected per address.

use crate::error::{NetworkError, Result};
use crate::network::{Message, MessageHandler, PeerConnector, PeerLink};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a node reacts to inbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Calls fail as if the process were gone.
    Crashed,
    /// Calls are acknowledged but the message is lost.
    Blackhole,
}

#[derive(Default)]
struct NetworkState {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    faults: RwLock<HashMap<String, LinkFault>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `address` to `handler`.
    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let address = address.into();
        self.state.faults.write().remove(&address);
        self.state.handlers.write().insert(address, handler);
    }

    pub fn unregister(&self, address: &str) {
        self.state.handlers.write().remove(address);
    }

    /// Make `address` unreachable.
    pub fn crash(&self, address: &str) {
        self.state
            .faults
            .write()
            .insert(address.to_string(), LinkFault::Crashed);
    }

    /// Acknowledge but lose every message sent to `address`.
    pub fn blackhole(&self, address: &str) {
        self.state
            .faults
            .write()
            .insert(address.to_string(), LinkFault::Blackhole);
    }

    /// Clear any fault on `address`.
    pub fn restore(&self, address: &str) {
        self.state.faults.write().remove(address);
    }

    pub fn fault(&self, address: &str) -> Option<LinkFault> {
        self.state.faults.read().get(address).copied()
    }

    /// Addresses with an injected fault.
    pub fn faulty(&self) -> HashSet<String> {
        self.state.faults.read().keys().cloned().collect()
    }

    /// Messages handed to a handler.
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    /// Messages lost to a fault or a missing handler.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl PeerConnector for LocalNetwork {
    fn connect(&self, address: &str) -> Arc<dyn PeerLink> {
        Arc::new(LocalLink {
            address: address.to_string(),
            state: self.state.clone(),
        })
    }
}

struct LocalLink {
    address: String,
    state: Arc<NetworkState>,
}

impl LocalLink {
    fn unreachable(&self) -> crate::error::Error {
        self.state.dropped.fetch_add(1, Ordering::Relaxed);
        NetworkError::ConnectionFailed {
            addr: self.address.clone(),
            reason: "unreachable".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl PeerLink for LocalLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, msg: Message) -> Result<Message> {
        // Let the receiver's tasks run between hops.
        tokio::task::yield_now().await;

        let fault = self.state.faults.read().get(&self.address).copied();
        match fault {
            Some(LinkFault::Crashed) => return Err(self.unreachable()),
            Some(LinkFault::Blackhole) => {
                self.state.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(Message::Ack);
            }
            None => {}
        }

        let handler = self.state.handlers.read().get(&self.address).cloned();
        let Some(handler) = handler else {
            return Err(self.unreachable());
        };

        self.state.delivered.fetch_add(1, Ordering::Relaxed);
        handler
            .handle(msg)
            .ok_or_else(|| NetworkError::ConnectionClosed.into())
    }
}
