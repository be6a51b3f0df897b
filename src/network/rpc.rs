//! RPC message types for inter-node communication.

use crate::acquisition::SensorReadingsToken;
use crate::discovery::DiscoveryToken;
use crate::error::{NetworkError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a single frame on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Network message wrapper for all ring communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sensor-reading token handed to the ring successor.
    SensorReadings(SensorReadingsToken),

    /// Discovery/election token handed to the ring successor.
    Discovery(DiscoveryToken),

    /// A node announcing itself to its ring predecessor.
    NewNeighbour(NewNeighbour),

    /// Acknowledgment that the local step was applied.
    Ack,
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SensorReadings(_) => "sensor_readings",
            Message::Discovery(_) => "discovery",
            Message::NewNeighbour(_) => "new_neighbour",
            Message::Ack => "ack",
        }
    }
}

/// Announcement sent by a joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNeighbour {
    /// Id of the announcing node.
    pub id: NodeId,

    /// Address the announcing node listens on.
    pub address: String,
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::MessageTooLarge(data.len()).into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer
        .write_all(&framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one framed message. Returns `None` if the peer closed the stream
/// cleanly before a new frame started.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::MessageTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    Ok(Some(decode_message(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryToken;
    use crate::types::HostMap;

    #[test]
    fn test_frame_message() {
        let msg = Message::NewNeighbour(NewNeighbour {
            id: 7,
            address: "127.0.0.1:9000".to_string(),
        });

        let framed = frame_message(&msg).unwrap();

        // First 4 bytes should be length
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let decoded = decode_message(&framed[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_read_write_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let mut hosts = HostMap::new();
        hosts.insert(1, "localhost:8080".to_string());
        let token = DiscoveryToken::initial(1, hosts.clone(), hosts, false);
        let msg = Message::Discovery(token);

        write_frame(&mut a, &msg).await.unwrap();
        write_frame(&mut a, &Message::Ack).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(msg));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Message::Ack));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32) + 1;
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
