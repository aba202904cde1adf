//! Peer transport seam
//!
//! The mediator only needs to hand an encoded message to a peer. Network
//! transports (and their timeouts, retries and discovery) live outside this
//! crate; [`ChannelTransport`] wires mediators together in-process.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Outbound half of a peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one encoded message to `peer_key`
    async fn send(&self, peer_key: &str, message: Vec<u8>) -> SyncResult<()>;
}

/// In-process transport backed by unbounded channels
#[derive(Default)]
pub struct ChannelTransport {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `peer_key` into a new channel and return its receiver
    pub fn register(&self, peer_key: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().insert(peer_key.to_string(), tx);
        rx
    }

    pub fn disconnect(&self, peer_key: &str) -> bool {
        self.peers.write().remove(peer_key).is_some()
    }

    pub fn is_connected(&self, peer_key: &str) -> bool {
        self.peers.read().contains_key(peer_key)
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send(&self, peer_key: &str, message: Vec<u8>) -> SyncResult<()> {
        let peers = self.peers.read();
        let tx = peers
            .get(peer_key)
            .ok_or_else(|| SyncError::Transport(format!("unknown peer {peer_key}")))?;
        tx.send(message)
            .map_err(|_| SyncError::Transport(format!("connection to {peer_key} closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_disconnect() {
        let transport = ChannelTransport::new();
        let mut rx = transport.register("b");
        transport.send("b", b"hi".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hi".to_vec());

        assert!(transport.disconnect("b"));
        assert!(matches!(
            transport.send("b", Vec::new()).await,
            Err(SyncError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_an_error() {
        let transport = ChannelTransport::new();
        drop(transport.register("c"));
        assert!(transport.send("c", Vec::new()).await.is_err());
    }
}
