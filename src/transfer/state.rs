//! Transfer job state

use crate::store::StoreError;
use crate::types::{PeerId, RecordingKey};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum TransferStatus {
    /// Created, handshake not acknowledged yet.
    Pending,
    /// Streaming chunks.
    Active,
    /// Every byte confirmed by the receiver.
    Complete,
    /// Interrupted or rejected; the cursor is kept for a retry.
    Error { message: String },
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Complete | TransferStatus::Error { .. })
    }
}

/// Snapshot of one transfer job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: JobId,
    pub key: RecordingKey,
    /// Peer the artifact is being delivered to.
    pub peer: PeerId,
    pub total_bytes: u64,
    /// Receiver-confirmed bytes; monotone, never exceeds `total_bytes`.
    pub bytes_transferred: u64,
    /// Next chunk the receiver expects; where a retry resumes.
    pub next_chunk_index: u64,
    pub status: TransferStatus,
}

impl TransferJob {
    /// Confirmed completion fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}

/// Emitted whenever any job's snapshot changes.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub job: TransferJob,
}

/// Transfer tuning knobs.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long the sender waits for the receiver to accept an offer.
    pub handshake_timeout: Duration,
    /// How long the sender waits for each chunk acknowledgment. Chunks are
    /// acked one-by-one: with ~1 s chunks that keeps resume granularity at
    /// about a second of media while bounding in-flight data to one chunk.
    pub ack_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("transfer rejected by receiver: {0}")]
    Rejected(String),

    #[error("a transfer for {0} is already running")]
    AlreadyRunning(RecordingKey),

    #[error("unknown transfer job")]
    UnknownJob,

    #[error("job is not in an error state; nothing to retry")]
    NotRetryable,

    #[error(transparent)]
    Store(#[from] StoreError),
}
