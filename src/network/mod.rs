//! Network Module
//!
//! Handles TCP communication between nodes.

mod client;
mod server;

pub use client::NetworkClient;
pub use server::NetworkServer;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Request/response channel to a peer node
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one message to `address` and wait for its reply
    async fn request(&self, address: &str, message: Message) -> Result<Message>;
}

/// Server-side dispatch of incoming peer messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the reply for one request
    async fn handle(&self, peer_addr: &str, message: Message) -> Message;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    if body.len() > FrameHeader::MAX_LENGTH as usize {
        return Err(Error::Network(format!(
            "{} of {} bytes exceeds frame limit",
            message.type_name(),
            body.len()
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::Heartbeat { node_id: "node-1".into() };

        write_message(&mut a, &msg).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            Message::Heartbeat { node_id } => assert_eq!(node_id, "node-1"),
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Message::StatusRequest.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let header = FrameHeader {
            length: FrameHeader::MAX_LENGTH + 1,
            checksum: 0,
        };
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
