//! Peer messaging channel
//!
//! The pipeline does not implement peer-to-peer transport; it consumes a
//! channel that delivers small control messages and chunk frames with
//! at-least-once semantics. `PeerChannel` is the outbound seam, inbound
//! messages arrive as `Envelope`s on an mpsc receiver handed to the session.

pub mod memory;

use crate::types::{PeerId, RecordingKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryChannel, MemoryHub};

/// Channel-layer errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("peer {0} is not connected")]
    Disconnected(PeerId),

    #[error("send failed: {0}")]
    Send(String),
}

/// Application-level messages exchanged between peers.
///
/// Control messages drive the recording coordinator; transfer frames carry
/// chunk data and delivery acknowledgments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PeerMessage {
    /// Host asks everyone to show a countdown; capture does not start yet.
    CountdownRequest { seconds: u32 },
    /// Host schedules capture start at a wall-clock instant slightly in the
    /// future so all peers begin as close to simultaneously as the channel
    /// allows.
    Start { target_unix_ms: u64 },
    /// A peer confirms it started capture, reporting its observed instant.
    StartAck { actual_start_unix_ms: u64 },
    /// Host asks everyone to stop capture and finalize.
    Stop,

    /// Sender proposes transferring one finalized artifact.
    TransferOffer {
        key: RecordingKey,
        total_bytes: u64,
        chunk_count: u64,
    },
    /// Receiver accepts, naming the next chunk index it expects. A resumed
    /// transfer picks up from here.
    TransferAccept { key: RecordingKey, next_index: u64 },
    /// One chunk of artifact data.
    TransferChunk {
        key: RecordingKey,
        index: u64,
        bytes: Vec<u8>,
    },
    /// Receiver confirms cumulative delivered bytes for a transfer.
    TransferAck {
        key: RecordingKey,
        bytes_transferred: u64,
    },
    /// Receiver aborts a transfer it cannot apply.
    TransferReject { key: RecordingKey, reason: String },
}

impl PeerMessage {
    /// Whether this message belongs to the transfer protocol.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            PeerMessage::TransferOffer { .. }
                | PeerMessage::TransferAccept { .. }
                | PeerMessage::TransferChunk { .. }
                | PeerMessage::TransferAck { .. }
                | PeerMessage::TransferReject { .. }
        )
    }
}

/// An inbound message together with its origin.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: PeerId,
    pub message: PeerMessage,
}

/// Outbound half of the peer messaging channel.
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    /// The peer this channel belongs to.
    fn local_peer(&self) -> &PeerId;

    /// Send one message to one peer.
    async fn send(&self, to: &PeerId, message: PeerMessage) -> Result<(), ChannelError>;
}

/// Split one inbound stream into coordinator messages and transfer frames.
///
/// Both the coordinator and the transfer manager consume the same underlying
/// channel; this router keeps each of them single-purpose.
pub fn split_messages(
    mut inbound: mpsc::Receiver<Envelope>,
) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<Envelope>) {
    let (control_tx, control_rx) = mpsc::channel(64);
    let (transfer_tx, transfer_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            let tx = if envelope.message.is_transfer() {
                &transfer_tx
            } else {
                &control_tx
            };
            // A dropped consumer only mutes its own half of the stream.
            if tx.send(envelope).await.is_err() {
                tracing::debug!("message consumer gone; frame dropped");
            }
        }
    });

    (control_rx, transfer_rx)
}
