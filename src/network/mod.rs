//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{PeerClient, PeerConnector, PeerLink, TcpConnector, TransportConfig};
pub use rpc::{Message, NewNeighbour};
pub use server::{MessageHandler, NetworkServer};
