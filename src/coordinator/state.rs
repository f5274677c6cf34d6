//! Coordinator state types
//!
//! The per-session state machine, per-peer status as the host sees it, and
//! the events the coordinator emits.

use crate::capture::CaptureError;
use crate::store::{ArtifactInfo, StoreError};
use crate::types::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Session lifecycle, replicated conceptually at every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    CountdownPending,
    Recording,
    Stopped,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

/// What the host knows about one peer's participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerStatus {
    /// In the roster, nothing asked of it yet.
    Invited,
    /// Countdown or start broadcast sent, ack pending.
    CountingDown,
    /// Acked the start; capturing.
    Recording,
    /// Never acknowledged the start within the timeout: this peer records
    /// nothing and contributes no artifact, the session continues without it.
    Skipped,
    Stopped,
}

/// Estimated difference between the broadcast target start instant and the
/// instant this peer actually began capturing. Established once per
/// recording; diagnostics only, never used to shift media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClockOffset {
    pub offset_ms: i64,
}

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How far in the future the host schedules the start instant. Must be
    /// at least one round-trip so every peer sees the message before the
    /// instant passes.
    pub start_buffer: Duration,
    /// How long the host waits for start acknowledgments before marking a
    /// peer as skipped.
    pub ack_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            start_buffer: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of the session, published over a watch channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: Phase,
    pub peers: HashMap<PeerId, PeerStatus>,
    pub clock_offset: Option<SessionClockOffset>,
}

/// Events emitted while the session runs.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Countdown requested; capture has not started yet.
    CountdownStarted { seconds: u32 },
    /// Local capture began.
    Started,
    /// A peer never acknowledged the start and was skipped. `reason` is the
    /// rendered `CoordinatorError::PeerUnresponsive`.
    PeerSkipped { peer: PeerId, reason: String },
    /// A peer's status changed (host side).
    PeerStateChanged { peer: PeerId, status: PeerStatus },
    /// Local capture stopped and finalized; `artifact` is `None` when the
    /// local recording failed to finalize.
    Stopped {
        artifact: Option<ArtifactInfo>,
        duration_ms: u64,
    },
    /// Local capture failed terminally mid-recording.
    CaptureFailed { message: String },
}

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("operation requires the session host")]
    NotHost,

    #[error("invalid state for this operation: {0:?}")]
    InvalidState(Phase),

    #[error("peer {0} did not acknowledge start in time")]
    PeerUnresponsive(PeerId),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("coordinator task terminated")]
    Terminated,
}
