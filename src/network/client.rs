//! Outbound links to ring peers.
//!
//! A link is opened lazily on its first call and keeps a single TCP stream.
//! Calls are never retried: a failed call drops the cached stream and
//! surfaces the error, leaving recovery to the ring protocol.

use crate::config::TimeoutConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A request/acknowledge channel to one peer address.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Address this link talks to.
    fn address(&self) -> &str;

    /// Send a message and wait for the peer's reply.
    async fn call(&self, msg: Message) -> Result<Message>;
}

/// Factory for peer links.
pub trait PeerConnector: Send + Sync + 'static {
    /// Create a link to `address`. Must not perform I/O.
    fn connect(&self, address: &str) -> Arc<dyn PeerLink>;
}

/// Configuration for transport behavior
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Time allowed for a request and its reply
    pub rpc_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for TransportConfig {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self {
            connect_timeout: timeouts.connect_timeout,
            rpc_timeout: timeouts.rpc_timeout,
        }
    }
}

/// TCP link to a single peer.
pub struct PeerClient {
    address: String,
    config: TransportConfig,
    stream: Mutex<Option<TcpStream>>,
}

impl PeerClient {
    /// Create a client; no connection is made until the first call.
    pub fn new(address: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            address: address.into(),
            config,
            stream: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.address.as_str()),
        )
        .await
        .map_err(|_| NetworkError::ConnectionFailed {
            addr: self.address.clone(),
            reason: "connect timeout".to_string(),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            addr: self.address.clone(),
            reason: e.to_string(),
        })?;
        let _ = stream.set_nodelay(true);
        debug!(addr = %self.address, "Opened peer connection");
        Ok(stream)
    }

    async fn round_trip(stream: &mut TcpStream, msg: &Message) -> Result<Message> {
        write_frame(stream, msg).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| NetworkError::ConnectionClosed.into())
    }
}

#[async_trait]
impl PeerLink for PeerClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, msg: Message) -> Result<Message> {
        let mut guard = self.stream.lock().await;

        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };

        trace!(addr = %self.address, kind = msg.kind(), "Sending message");
        let outcome = tokio::time::timeout(
            self.config.rpc_timeout,
            Self::round_trip(&mut stream, &msg),
        )
        .await;

        match outcome {
            Ok(Ok(reply)) => {
                *guard = Some(stream);
                Ok(reply)
            }
            Ok(Err(e)) => {
                debug!(addr = %self.address, error = %e, "Peer call failed, dropping connection");
                Err(e)
            }
            Err(_) => {
                debug!(addr = %self.address, "Peer call timed out, dropping connection");
                Err(Error::Timeout)
            }
        }
    }
}

/// Creates TCP peer clients.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    /// Create a connector with the given transport configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl PeerConnector for TcpConnector {
    fn connect(&self, address: &str) -> Arc<dyn PeerLink> {
        Arc::new(PeerClient::new(address, self.config.clone()))
    }
}
