//! TCP server for incoming ring messages.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use crate::types::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Handler for incoming messages.
///
/// Called on the connection task; it must apply the local protocol step and
/// return without waiting on any other peer.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    fn handle(&self, msg: Message) -> Option<Message>;
}

/// TCP server for ring communication.
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// This node's ID.
    node_id: NodeId,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a new network server.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            node_id,
            handler,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the server.
    pub async fn run(mut self) -> Result<()> {
        info!(node_id = self.node_id, addr = ?self.listener.local_addr().ok(), "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(node_id = self.node_id, peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let node_id = self.node_id;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, node_id).await {
                                    debug!(node_id, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(node_id = self.node_id, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = self.node_id, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        node_id: NodeId,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);

        while let Some(msg) = read_frame(&mut stream).await? {
            trace!(node_id, kind = msg.kind(), "Received message");

            if let Some(response) = handler.handle(msg) {
                write_frame(&mut stream, &response).await?;
            }
        }

        // Connection closed
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::NewNeighbour;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Message>>,
    }

    impl MessageHandler for RecordingHandler {
        fn handle(&self, msg: Message) -> Option<Message> {
            self.seen.lock().push(msg);
            Some(Message::Ack)
        }
    }

    #[tokio::test]
    async fn test_server_acks_every_frame() {
        let handler = Arc::new(RecordingHandler::default());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = NetworkServer::bind(addr, 1, handler.clone()).await.unwrap();
        let actual_addr = server.local_addr().unwrap();

        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut stream = TcpStream::connect(actual_addr).await.unwrap();
        for id in [2, 3] {
            let msg = Message::NewNeighbour(NewNeighbour {
                id,
                address: format!("localhost:{}", 9000 + id),
            });
            write_frame(&mut stream, &msg).await.unwrap();
            let reply = read_frame(&mut stream).await.unwrap();
            assert_eq!(reply, Some(Message::Ack));
        }

        assert_eq!(handler.seen.lock().len(), 2);

        let _ = shutdown_tx.send(()).await;
        let _ = server_handle.await;
    }
}
