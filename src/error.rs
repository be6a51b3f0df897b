//! Error types for the sensor ring.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Result type alias for sensor ring operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sensor ring.
#[derive(Error, Debug)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Ring protocol errors.
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// Upstream gateway errors.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame exceeds the maximum message size.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Ring protocol errors.
#[derive(Error, Debug)]
pub enum RingError {
    /// Every successor was unreachable; membership collapsed to this node.
    #[error("all {tried} neighbours of node {node_id} are unreachable")]
    Isolated { node_id: NodeId, tried: usize },

    /// A peer answered with something other than an acknowledgment.
    #[error("unexpected reply from node {peer_id}: {reply}")]
    UnexpectedReply { peer_id: NodeId, reply: String },
}

/// Upstream gateway errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP transport failure.
    #[error("request failed: {0}")]
    Request(String),

    /// The gateway answered with a non-success status.
    #[error("gateway returned status {status} for {path}")]
    Status { status: u16, path: String },

    /// Local sink I/O failure.
    #[error("sink io error: {0}")]
    Io(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Gateway(GatewayError::Request(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: Error = RingError::Isolated {
            node_id: 3,
            tried: 2,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "ring error: all 2 neighbours of node 3 are unreachable"
        );

        let err: Error = NetworkError::ConnectionFailed {
            addr: "localhost:8080".to_string(),
            reason: "refused".to_string(),
        }
        .into();
        assert!(err.to_string().contains("localhost:8080"));
    }
}
