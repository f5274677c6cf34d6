//! Transfer manager
//!
//! One manager per peer, serving both directions: outbound jobs stream a
//! finalized artifact chunk-by-chunk and advance only on receiver
//! acknowledgment; the inbound side applies chunks through the chunk store's
//! contiguity invariant, which makes resend-after-resume idempotent.

use crate::channel::{Envelope, PeerChannel, PeerMessage};
use crate::store::{ChunkStore, ChunkWriter, StoreError};
use crate::transfer::state::{
    JobId, TransferConfig, TransferError, TransferEvent, TransferJob, TransferStatus,
};
use crate::types::{PeerId, RecordingKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Coordinates all transfers for one peer.
pub struct TransferManager<C: PeerChannel> {
    shared: Arc<Shared<C>>,
    dispatcher: JoinHandle<()>,
}

struct Shared<C: PeerChannel> {
    channel: Arc<C>,
    store: Arc<ChunkStore>,
    config: TransferConfig,
    /// Snapshot per job, kept current by the job tasks.
    jobs: RwLock<HashMap<JobId, TransferJob>>,
    /// Inbox per in-flight outbound transfer, keyed by recording.
    routes: RwLock<HashMap<RecordingKey, mpsc::Sender<PeerMessage>>>,
    events: broadcast::Sender<TransferEvent>,
}

/// An artifact currently being received.
struct InboundTransfer {
    from: PeerId,
    writer: ChunkWriter,
    chunk_count: u64,
}

impl<C: PeerChannel> TransferManager<C> {
    /// Spawn the manager. `transfer_rx` is the transfer half of this peer's
    /// inbound messages (see `channel::split_messages`).
    pub fn spawn(
        store: Arc<ChunkStore>,
        channel: Arc<C>,
        transfer_rx: mpsc::Receiver<Envelope>,
        config: TransferConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            channel,
            store,
            config,
            jobs: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            events: event_tx,
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), transfer_rx));
        Self { shared, dispatcher }
    }

    /// Push one finalized artifact to `to`. Returns the job id; the transfer
    /// itself runs on its own task.
    pub fn push(&self, key: RecordingKey, to: PeerId) -> Result<JobId, TransferError> {
        let artifact = self.shared.store.artifact(&key)?;

        {
            let mut routes = self.shared.routes.write();
            if routes.contains_key(&key) {
                return Err(TransferError::AlreadyRunning(key));
            }
            // Reserve the route; the job task installs its real inbox.
            routes.insert(key.clone(), mpsc::channel(1).0);
        }

        let id = JobId::generate();
        let job = TransferJob {
            id,
            key: key.clone(),
            peer: to.clone(),
            total_bytes: artifact.total_bytes,
            bytes_transferred: 0,
            next_chunk_index: 0,
            status: TransferStatus::Pending,
        };
        self.shared.jobs.write().insert(id, job.clone());
        let _ = self.shared.events.send(TransferEvent { job });

        tracing::info!(%key, %to, %id, "transfer job created");
        tokio::spawn(run_outbound_job(
            Arc::clone(&self.shared),
            id,
            key,
            to,
            artifact.chunk_count,
            artifact.total_bytes,
        ));
        Ok(id)
    }

    /// Retry a failed job. Resumes from the receiver's next expected index,
    /// re-established by the handshake.
    pub fn retry(&self, id: JobId) -> Result<(), TransferError> {
        let (key, to, chunk_count, total_bytes) = {
            let jobs = self.shared.jobs.read();
            let job = jobs.get(&id).ok_or(TransferError::UnknownJob)?;
            if !matches!(job.status, TransferStatus::Error { .. }) {
                return Err(TransferError::NotRetryable);
            }
            let artifact = self.shared.store.artifact(&job.key)?;
            (
                job.key.clone(),
                job.peer.clone(),
                artifact.chunk_count,
                artifact.total_bytes,
            )
        };

        {
            let mut routes = self.shared.routes.write();
            if routes.contains_key(&key) {
                return Err(TransferError::AlreadyRunning(key));
            }
            routes.insert(key.clone(), mpsc::channel(1).0);
        }

        update_job(&self.shared, id, |job| {
            job.status = TransferStatus::Pending;
        });
        tracing::info!(%key, %id, "transfer job retrying");
        tokio::spawn(run_outbound_job(
            Arc::clone(&self.shared),
            id,
            key,
            to,
            chunk_count,
            total_bytes,
        ));
        Ok(())
    }

    /// Snapshot of every job, newest state included.
    pub fn jobs(&self) -> Vec<TransferJob> {
        self.shared.jobs.read().values().cloned().collect()
    }

    pub fn job(&self, id: JobId) -> Option<TransferJob> {
        self.shared.jobs.read().get(&id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }
}

impl<C: PeerChannel> Drop for TransferManager<C> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn update_job<C: PeerChannel>(
    shared: &Arc<Shared<C>>,
    id: JobId,
    mutate: impl FnOnce(&mut TransferJob),
) {
    let updated = {
        let mut jobs = shared.jobs.write();
        let Some(job) = jobs.get_mut(&id) else { return };
        mutate(job);
        job.clone()
    };
    let _ = shared.events.send(TransferEvent { job: updated });
}

/// Sender side: one task per job, owning the job's cursor.
async fn run_outbound_job<C: PeerChannel>(
    shared: Arc<Shared<C>>,
    id: JobId,
    key: RecordingKey,
    to: PeerId,
    chunk_count: u64,
    total_bytes: u64,
) {
    let (inbox_tx, inbox_rx) = mpsc::channel(16);
    shared.routes.write().insert(key.clone(), inbox_tx);

    let result = stream_artifact(
        &shared,
        id,
        &key,
        &to,
        chunk_count,
        total_bytes,
        inbox_rx,
    )
    .await;

    shared.routes.write().remove(&key);
    match result {
        Ok(()) => {
            update_job(&shared, id, |job| {
                job.status = TransferStatus::Complete;
                job.bytes_transferred = total_bytes;
                job.next_chunk_index = chunk_count;
            });
            tracing::info!(%key, %id, "transfer complete");
        }
        Err(e) => {
            tracing::warn!(%key, %id, error = %e, "transfer failed; cursor kept for retry");
            update_job(&shared, id, |job| {
                job.status = TransferStatus::Error {
                    message: e.to_string(),
                };
            });
        }
    }
}

async fn stream_artifact<C: PeerChannel>(
    shared: &Arc<Shared<C>>,
    id: JobId,
    key: &RecordingKey,
    to: &PeerId,
    chunk_count: u64,
    total_bytes: u64,
    mut inbox: mpsc::Receiver<PeerMessage>,
) -> Result<(), TransferError> {
    let offer = PeerMessage::TransferOffer {
        key: key.clone(),
        total_bytes,
        chunk_count,
    };
    shared
        .channel
        .send(to, offer)
        .await
        .map_err(|e| TransferError::Interrupted(e.to_string()))?;

    let accept = timeout(shared.config.handshake_timeout, inbox.recv())
        .await
        .map_err(|_| TransferError::Interrupted("handshake timed out".into()))?
        .ok_or_else(|| TransferError::Interrupted("manager shut down".into()))?;

    let mut next = match accept {
        PeerMessage::TransferAccept { next_index, .. } => next_index,
        PeerMessage::TransferReject { reason, .. } => {
            return Err(TransferError::Rejected(reason));
        }
        other => {
            return Err(TransferError::Interrupted(format!(
                "unexpected handshake reply: {other:?}"
            )));
        }
    };

    update_job(shared, id, |job| {
        job.status = TransferStatus::Active;
        job.next_chunk_index = next;
    });

    while next < chunk_count {
        let bytes = shared.store.read_chunk(key, next)?;
        let frame = PeerMessage::TransferChunk {
            key: key.clone(),
            index: next,
            bytes: bytes.to_vec(),
        };
        shared
            .channel
            .send(to, frame)
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))?;

        let reply = timeout(shared.config.ack_timeout, inbox.recv())
            .await
            .map_err(|_| TransferError::Interrupted("ack timed out".into()))?
            .ok_or_else(|| TransferError::Interrupted("manager shut down".into()))?;

        match reply {
            PeerMessage::TransferAck {
                bytes_transferred, ..
            } => {
                next += 1;
                // Progress is confirmed delivery only; clamp monotone.
                update_job(shared, id, |job| {
                    job.next_chunk_index = next;
                    job.bytes_transferred = job
                        .bytes_transferred
                        .max(bytes_transferred.min(job.total_bytes));
                });
            }
            PeerMessage::TransferReject { reason, .. } => {
                return Err(TransferError::Rejected(reason));
            }
            other => {
                return Err(TransferError::Interrupted(format!(
                    "unexpected reply mid-stream: {other:?}"
                )));
            }
        }
    }

    Ok(())
}

/// Routes inbound frames: offers and chunks to the receiving side, accepts
/// and acks to the outbound job that is waiting for them.
async fn dispatch_loop<C: PeerChannel>(
    shared: Arc<Shared<C>>,
    mut transfer_rx: mpsc::Receiver<Envelope>,
) {
    let mut inbound: HashMap<RecordingKey, InboundTransfer> = HashMap::new();

    while let Some(Envelope { from, message }) = transfer_rx.recv().await {
        match message {
            PeerMessage::TransferOffer {
                key,
                total_bytes,
                chunk_count,
            } => {
                handle_offer(&shared, &mut inbound, from, key, total_bytes, chunk_count).await;
            }
            PeerMessage::TransferChunk { key, index, bytes } => {
                handle_chunk(&shared, &mut inbound, from, key, index, bytes).await;
            }
            reply @ (PeerMessage::TransferAccept { .. }
            | PeerMessage::TransferAck { .. }
            | PeerMessage::TransferReject { .. }) => {
                let key = match &reply {
                    PeerMessage::TransferAccept { key, .. }
                    | PeerMessage::TransferAck { key, .. }
                    | PeerMessage::TransferReject { key, .. } => key.clone(),
                    _ => unreachable!(),
                };
                let route = shared.routes.read().get(&key).cloned();
                match route {
                    Some(tx) => {
                        let _ = tx.send(reply).await;
                    }
                    None => {
                        tracing::debug!(%key, "reply for unknown transfer job dropped");
                    }
                }
            }
            other => {
                tracing::warn!(%from, message = ?other, "control frame reached the transfer manager");
            }
        }
    }
}

async fn handle_offer<C: PeerChannel>(
    shared: &Arc<Shared<C>>,
    inbound: &mut HashMap<RecordingKey, InboundTransfer>,
    from: PeerId,
    key: RecordingKey,
    total_bytes: u64,
    chunk_count: u64,
) {
    // A re-offer replaces the previous attempt; dropping the stale writer
    // releases its lease so the store cursor can be re-read.
    inbound.remove(&key);

    // Already have the whole artifact: accept at the end so the sender
    // completes without resending anything.
    match shared.store.is_finalized(&key) {
        Ok(true) => {
            tracing::info!(%key, %from, "offer for already-received artifact");
            reply(shared, &from, PeerMessage::TransferAccept {
                key,
                next_index: chunk_count,
            })
            .await;
            return;
        }
        Ok(false) => {}
        Err(e) => {
            reject(shared, &from, key, e.to_string()).await;
            return;
        }
    }

    match shared.store.writer(key.clone()) {
        Ok(writer) => {
            let next_index = writer.next_index();
            tracing::info!(%key, %from, next_index, total_bytes, "inbound transfer accepted");
            inbound.insert(
                key.clone(),
                InboundTransfer {
                    from: from.clone(),
                    writer,
                    chunk_count,
                },
            );
            reply(shared, &from, PeerMessage::TransferAccept { key, next_index }).await;
        }
        Err(e) => {
            tracing::warn!(%key, %from, error = %e, "inbound transfer rejected");
            reject(shared, &from, key, e.to_string()).await;
        }
    }
}

async fn handle_chunk<C: PeerChannel>(
    shared: &Arc<Shared<C>>,
    inbound: &mut HashMap<RecordingKey, InboundTransfer>,
    from: PeerId,
    key: RecordingKey,
    index: u64,
    bytes: Vec<u8>,
) {
    let Some(transfer) = inbound.get_mut(&key) else {
        reject(shared, &from, key, "no transfer in progress".into()).await;
        return;
    };
    if transfer.from != from {
        reject(shared, &from, key, "transfer owned by another peer".into()).await;
        return;
    }

    let expected = transfer.writer.next_index();
    if index < expected {
        // Duplicate from an at-least-once resend; confirm what we hold.
        let held = transfer.writer.bytes_written();
        reply(shared, &from, PeerMessage::TransferAck {
            key,
            bytes_transferred: held,
        })
        .await;
        return;
    }

    match transfer.writer.append(index, &bytes) {
        Ok(()) => {}
        Err(e @ StoreError::OutOfOrderChunk { .. }) => {
            // A gap is a protocol violation; fail this transfer only. The
            // contiguous prefix stays on disk for the retry to resume from.
            tracing::warn!(%key, index, expected, "out-of-order chunk; transfer failed");
            inbound.remove(&key);
            reject(shared, &from, key, e.to_string()).await;
            return;
        }
        Err(e) => {
            tracing::error!(%key, error = %e, "chunk append failed");
            inbound.remove(&key);
            reject(shared, &from, key, e.to_string()).await;
            return;
        }
    }

    let received = transfer.writer.bytes_written();
    let done = transfer.writer.next_index() == transfer.chunk_count;
    if done {
        if let Some(transfer) = inbound.remove(&key) {
            match transfer.writer.finalize() {
                Ok(artifact) => {
                    tracing::info!(%key, bytes = artifact.total_bytes, "inbound transfer finalized");
                }
                Err(e) => {
                    tracing::error!(%key, error = %e, "inbound finalize failed");
                    reject(shared, &from, key, e.to_string()).await;
                    return;
                }
            }
        }
    }
    reply(shared, &from, PeerMessage::TransferAck {
        key,
        bytes_transferred: received,
    })
    .await;
}

async fn reply<C: PeerChannel>(shared: &Arc<Shared<C>>, to: &PeerId, message: PeerMessage) {
    if let Err(e) = shared.channel.send(to, message).await {
        tracing::warn!(%to, error = %e, "transfer reply failed");
    }
}

async fn reject<C: PeerChannel>(
    shared: &Arc<Shared<C>>,
    to: &PeerId,
    key: RecordingKey,
    reason: String,
) {
    reply(shared, to, PeerMessage::TransferReject { key, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{split_messages, MemoryChannel, MemoryHub};
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_config() -> TransferConfig {
        TransferConfig {
            handshake_timeout: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(200),
        }
    }

    struct TestNode {
        manager: TransferManager<MemoryChannel>,
        store: Arc<ChunkStore>,
        _dir: tempfile::TempDir,
    }

    fn spawn_node(hub: &MemoryHub, peer: &str) -> TestNode {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let (channel, rx) = hub.connect(peer.into());
        let (_control_rx, transfer_rx) = split_messages(rx);
        let manager = TransferManager::spawn(
            Arc::clone(&store),
            Arc::new(channel),
            transfer_rx,
            fast_config(),
        );
        TestNode {
            manager,
            store,
            _dir: dir,
        }
    }

    fn seed_artifact(store: &ChunkStore, key: &RecordingKey, chunks: &[&[u8]]) -> u64 {
        let mut writer = store.writer(key.clone()).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            writer.append(i as u64, chunk).unwrap();
        }
        writer.finalize().unwrap().total_bytes
    }

    fn key(peer: &str) -> RecordingKey {
        RecordingKey::new("s1".into(), peer.into())
    }

    async fn wait_terminal(
        manager: &TransferManager<MemoryChannel>,
        id: JobId,
    ) -> TransferJob {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = manager.job(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job did not reach a terminal state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn artifact_arrives_bit_exact() {
        let hub = MemoryHub::new();
        let host = spawn_node(&hub, "host");
        let a = spawn_node(&hub, "a");

        let total = seed_artifact(&a.store, &key("a"), &[b"chunk0-", b"chunk1-", b"chunk2"]);
        let id = a.manager.push(key("a"), "host".into()).unwrap();
        let job = wait_terminal(&a.manager, id).await;

        assert_eq!(job.status, TransferStatus::Complete);
        assert_eq!(job.bytes_transferred, total);
        assert!((job.progress() - 1.0).abs() < f64::EPSILON);

        let artifact = host.store.artifact(&key("a")).unwrap();
        assert_eq!(
            std::fs::read(&artifact.path).unwrap(),
            b"chunk0-chunk1-chunk2"
        );
    }

    #[tokio::test]
    async fn resumes_from_receiver_cursor() {
        let hub = MemoryHub::new();
        let host = spawn_node(&hub, "host");
        let a = spawn_node(&hub, "a");

        seed_artifact(&a.store, &key("a"), &[b"aaaa", b"bbbb", b"cccc", b"dddd"]);

        // The host already holds the first two chunks from an interrupted
        // earlier attempt.
        {
            let mut writer = host.store.writer(key("a")).unwrap();
            writer.append(0, b"aaaa").unwrap();
            writer.append(1, b"bbbb").unwrap();
        }

        let id = a.manager.push(key("a"), "host".into()).unwrap();
        let job = wait_terminal(&a.manager, id).await;
        assert_eq!(job.status, TransferStatus::Complete);

        let artifact = host.store.artifact(&key("a")).unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"aaaabbbbccccdddd");
    }

    #[tokio::test]
    async fn disconnect_errors_job_and_retry_completes() {
        let hub = MemoryHub::new();
        let a = spawn_node(&hub, "a");
        seed_artifact(&a.store, &key("a"), &[b"xx", b"yy", b"zz"]);

        // Host not connected: the handshake times out and the job errors.
        let id = a.manager.push(key("a"), "host".into()).unwrap();
        let job = wait_terminal(&a.manager, id).await;
        assert!(matches!(job.status, TransferStatus::Error { .. }));

        // Host comes online; retry resumes (from zero here) and completes.
        let host = spawn_node(&hub, "host");
        a.manager.retry(id).unwrap();
        let job = wait_terminal(&a.manager, id).await;
        assert_eq!(job.status, TransferStatus::Complete);
        assert!(host.store.is_finalized(&key("a")).unwrap());
    }

    #[tokio::test]
    async fn jobs_race_independently_and_one_failure_spares_the_rest() {
        let hub = MemoryHub::new();
        let host = spawn_node(&hub, "host");
        let a = spawn_node(&hub, "a");
        let b = spawn_node(&hub, "b");

        seed_artifact(&a.store, &key("a"), &[b"a0", b"a1", b"a2", b"a3"]);
        seed_artifact(&b.store, &key("b"), &[b"b0", b"b1"]);

        // "a" targets a peer that does not exist, "b" targets the host.
        let id_a = a.manager.push(key("a"), "nowhere".into()).unwrap();
        let id_b = b.manager.push(key("b"), "host".into()).unwrap();

        let job_a = wait_terminal(&a.manager, id_a).await;
        let job_b = wait_terminal(&b.manager, id_b).await;

        assert!(matches!(job_a.status, TransferStatus::Error { .. }));
        assert_eq!(job_b.status, TransferStatus::Complete);
        assert!(host.store.is_finalized(&key("b")).unwrap());
    }

    #[tokio::test]
    async fn progress_is_monotone_until_terminal() {
        let hub = MemoryHub::new();
        let _host = spawn_node(&hub, "host");
        let a = spawn_node(&hub, "a");

        seed_artifact(
            &a.store,
            &key("a"),
            &[b"0000", b"1111", b"2222", b"3333", b"4444"],
        );

        let mut events = a.manager.subscribe();
        let id = a.manager.push(key("a"), "host".into()).unwrap();
        let final_job = wait_terminal(&a.manager, id).await;
        assert_eq!(final_job.status, TransferStatus::Complete);

        let mut last = 0u64;
        while let Ok(event) = events.try_recv() {
            assert!(event.job.bytes_transferred >= last);
            assert!(event.job.bytes_transferred <= event.job.total_bytes);
            last = event.job.bytes_transferred;
        }
        assert_eq!(last, final_job.total_bytes);
    }

    #[tokio::test]
    async fn push_requires_finalized_artifact() {
        let hub = MemoryHub::new();
        let a = spawn_node(&hub, "a");
        {
            let mut writer = a.store.writer(key("a")).unwrap();
            writer.append(0, b"partial").unwrap();
        }
        assert!(matches!(
            a.manager.push(key("a"), "host".into()),
            Err(TransferError::Store(StoreError::UnknownRecording(_)))
        ));
    }
}
