//! In-memory peer channel
//!
//! A process-local hub wiring peers together over mpsc queues. Used by tests
//! and by single-machine simulations; the delivery semantics (ordered,
//! at-least-once from the application's point of view, peers can drop out)
//! mirror what the real transport provides.

use super::{ChannelError, Envelope, PeerChannel, PeerMessage};
use crate::types::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const MAILBOX_CAPACITY: usize = 256;

/// Wires any number of in-process peers together.
#[derive(Clone, Default)]
pub struct MemoryHub {
    mailboxes: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Envelope>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer, returning its outbound channel and inbound mailbox.
    pub fn connect(&self, peer: PeerId) -> (MemoryChannel, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.mailboxes.lock().insert(peer.clone(), tx);
        (
            MemoryChannel {
                local_peer: peer,
                mailboxes: Arc::clone(&self.mailboxes),
            },
            rx,
        )
    }

    /// Detach a peer; subsequent sends to it fail with `Disconnected`.
    pub fn disconnect(&self, peer: &PeerId) {
        self.mailboxes.lock().remove(peer);
    }
}

/// One peer's outbound handle into a `MemoryHub`.
#[derive(Clone)]
pub struct MemoryChannel {
    local_peer: PeerId,
    mailboxes: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Envelope>>>>,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    async fn send(&self, to: &PeerId, message: PeerMessage) -> Result<(), ChannelError> {
        let tx = {
            let mailboxes = self.mailboxes.lock();
            mailboxes
                .get(to)
                .cloned()
                .ok_or_else(|| ChannelError::Disconnected(to.clone()))?
        };
        tx.send(Envelope {
            from: self.local_peer.clone(),
            message,
        })
        .await
        .map_err(|_| ChannelError::Disconnected(to.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_between_peers() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.connect("a".into());
        let (_b, mut b_rx) = hub.connect("b".into());

        a.send(&"b".into(), PeerMessage::Stop).await.unwrap();
        let envelope = b_rx.recv().await.unwrap();
        assert_eq!(envelope.from, PeerId::new("a"));
        assert!(matches!(envelope.message, PeerMessage::Stop));
    }

    #[tokio::test]
    async fn disconnected_peer_rejects_sends() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.connect("a".into());
        let (_b, _b_rx) = hub.connect("b".into());

        hub.disconnect(&"b".into());
        assert!(matches!(
            a.send(&"b".into(), PeerMessage::Stop).await,
            Err(ChannelError::Disconnected(_))
        ));
    }
}
