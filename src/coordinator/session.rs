//! Session coordinator task
//!
//! One event-driven task per peer: it consumes control messages from the
//! peer channel, commands from the local `CoordinatorHandle`, and the two
//! timers that matter (the scheduled start instant and the host's start-ack
//! deadline). Nothing here blocks the media pipeline; capture runs in its
//! own worker.

use crate::capture::{CaptureConfig, CaptureHandle, LocalCapture, MediaFeed};
use crate::channel::{Envelope, PeerChannel, PeerMessage};
use crate::coordinator::state::{
    CoordinatorConfig, CoordinatorError, CoordinatorEvent, PeerStatus, Phase, SessionClockOffset,
    SessionSnapshot,
};
use crate::store::{ArtifactInfo, ChunkStore};
use crate::types::{PeerId, RecordingKey, SessionId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Produces a fresh media feed each time a recording starts.
pub type FeedFactory = Box<dyn FnMut() -> Box<dyn MediaFeed> + Send + Sync>;

/// Outcome of stopping a recording on this peer.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    /// The local finalized artifact; `None` when finalize failed (the chunks
    /// remain on disk for recovery).
    pub artifact: Option<ArtifactInfo>,
    /// Recorded duration as observed locally.
    pub duration_ms: u64,
}

/// Options for joining (or hosting) a session.
pub struct SessionOptions {
    pub session_id: SessionId,
    pub host_peer: PeerId,
    /// Every peer in the session, the host included.
    pub roster: Vec<PeerId>,
    pub config: CoordinatorConfig,
    pub capture: CaptureConfig,
}

/// Spawns per-session coordinator tasks.
pub struct SessionCoordinator;

impl SessionCoordinator {
    /// Spawn the coordinator for the local peer.
    ///
    /// `control_rx` is the coordinator half of the peer's inbound messages
    /// (see `channel::split_messages`); `feeds` supplies the local media
    /// feed when capture starts.
    pub fn spawn<C: PeerChannel>(
        options: SessionOptions,
        channel: Arc<C>,
        control_rx: mpsc::Receiver<Envelope>,
        store: Arc<ChunkStore>,
        feeds: FeedFactory,
    ) -> CoordinatorHandle {
        let local_peer = channel.local_peer().clone();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(64);

        let peers: HashMap<PeerId, PeerStatus> = options
            .roster
            .iter()
            .cloned()
            .map(|p| (p, PeerStatus::Invited))
            .collect();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            session_id: options.session_id.clone(),
            phase: Phase::Idle,
            peers: peers.clone(),
            clock_offset: None,
        });

        let inner = Inner {
            session_id: options.session_id,
            local_peer,
            host_peer: options.host_peer,
            roster: options.roster,
            config: options.config,
            capture_config: options.capture,
            channel,
            store,
            feeds,
            phase: Phase::Idle,
            peers,
            clock_offset: None,
            capture: None,
            recording_started_at: None,
            pending_start: None,
            ack_deadline: None,
            events: event_tx.clone(),
            snapshot_tx,
        };

        let task = tokio::spawn(inner.run(command_rx, control_rx));

        CoordinatorHandle {
            commands: command_tx,
            events: event_tx,
            snapshot: snapshot_rx,
            task,
        }
    }
}

/// Local control surface for a running coordinator.
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CoordinatorEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Host-only: broadcast the countdown to every peer.
    pub async fn begin_countdown(&self, seconds: u32) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::BeginCountdown { seconds, reply })
            .await
    }

    /// Host-only: schedule the synchronized start.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Host-only: stop every peer; locally stops capture and finalizes.
    pub async fn stop(&self) -> Result<StopOutcome, CoordinatorError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the snapshot satisfies a predicate.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<(), CoordinatorError> {
        let mut rx = self.snapshot.clone();
        loop {
            if predicate(&rx.borrow()) {
                return Ok(());
            }
            rx.changed().await.map_err(|_| CoordinatorError::Terminated)?;
        }
    }

    /// Tear the coordinator down. An active local capture is stopped and
    /// finalized first, so a peer leaving mid-recording still contributes a
    /// truncated artifact.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, CoordinatorError>>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CoordinatorError::Terminated)?;
        response.await.map_err(|_| CoordinatorError::Terminated)?
    }
}

enum Command {
    BeginCountdown {
        seconds: u32,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<StopOutcome, CoordinatorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Inner<C: PeerChannel> {
    session_id: SessionId,
    local_peer: PeerId,
    host_peer: PeerId,
    roster: Vec<PeerId>,
    config: CoordinatorConfig,
    capture_config: CaptureConfig,
    channel: Arc<C>,
    store: Arc<ChunkStore>,
    feeds: FeedFactory,
    phase: Phase,
    peers: HashMap<PeerId, PeerStatus>,
    clock_offset: Option<SessionClockOffset>,
    capture: Option<CaptureHandle>,
    recording_started_at: Option<std::time::Instant>,
    /// Scheduled capture start: the local deadline and the broadcast target.
    pending_start: Option<(Instant, u64)>,
    /// Host: when unacked peers get marked skipped.
    ack_deadline: Option<Instant>,
    events: broadcast::Sender<CoordinatorEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<C: PeerChannel> Inner<C> {
    fn is_host(&self) -> bool {
        self.local_peer == self.host_peer
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<Envelope>,
    ) {
        let mut inbound_open = true;
        loop {
            let start_at = self.pending_start.map(|(at, _)| at);
            let ack_at = self.ack_deadline;

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::BeginCountdown { seconds, reply }) => {
                            let _ = reply.send(self.begin_countdown(seconds).await);
                        }
                        Some(Command::Start { reply }) => {
                            let _ = reply.send(self.schedule_start().await);
                        }
                        Some(Command::Stop { reply }) => {
                            let _ = reply.send(self.stop_session().await);
                        }
                        Some(Command::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        // Handle dropped: finalize anything in flight.
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                envelope = inbound.recv(), if inbound_open => {
                    match envelope {
                        Some(envelope) => self.handle_message(envelope).await,
                        None => inbound_open = false,
                    }
                }
                _ = sleep_until_opt(start_at), if start_at.is_some() => {
                    self.begin_local_capture().await;
                }
                _ = sleep_until_opt(ack_at), if ack_at.is_some() => {
                    self.expire_pending_acks();
                }
            }
        }
    }

    async fn handle_message(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            PeerMessage::CountdownRequest { seconds } => {
                if from != self.host_peer {
                    tracing::warn!(%from, "ignoring countdown request from non-host");
                    return;
                }
                if self.phase != Phase::Idle {
                    tracing::warn!(phase = ?self.phase, "countdown request in unexpected phase");
                    return;
                }
                self.phase = Phase::CountdownPending;
                let _ = self
                    .events
                    .send(CoordinatorEvent::CountdownStarted { seconds });
                self.publish();
            }
            PeerMessage::Start { target_unix_ms } => {
                if from != self.host_peer {
                    tracing::warn!(%from, "ignoring start from non-host");
                    return;
                }
                // Tolerate a resent start while already scheduled or
                // recording (at-least-once channel).
                if self.phase == Phase::Recording || self.pending_start.is_some() {
                    return;
                }
                self.phase = Phase::CountdownPending;
                self.pending_start = Some((instant_for_unix_ms(target_unix_ms), target_unix_ms));
                self.publish();
            }
            PeerMessage::StartAck {
                actual_start_unix_ms,
            } => {
                if !self.is_host() {
                    return;
                }
                tracing::debug!(%from, actual_start_unix_ms, "start acknowledged");
                self.set_peer_status(&from, PeerStatus::Recording);
                let still_pending = self
                    .peers
                    .values()
                    .any(|s| *s == PeerStatus::CountingDown);
                if !still_pending {
                    self.ack_deadline = None;
                }
            }
            PeerMessage::Stop => {
                if from != self.host_peer {
                    tracing::warn!(%from, "ignoring stop from non-host");
                    return;
                }
                if self.phase == Phase::Stopped {
                    return;
                }
                let _ = self.stop_local().await;
            }
            other => {
                tracing::warn!(%from, message = ?other, "transfer frame reached the coordinator");
            }
        }
    }

    async fn begin_countdown(&mut self, seconds: u32) -> Result<(), CoordinatorError> {
        if !self.is_host() {
            return Err(CoordinatorError::NotHost);
        }
        if self.phase != Phase::Idle {
            return Err(CoordinatorError::InvalidState(self.phase));
        }

        tracing::info!(session = %self.session_id, seconds, "countdown starting");
        self.broadcast(PeerMessage::CountdownRequest { seconds }).await;
        for peer in self.roster.clone() {
            self.set_peer_status(&peer, PeerStatus::CountingDown);
        }
        self.phase = Phase::CountdownPending;
        let _ = self
            .events
            .send(CoordinatorEvent::CountdownStarted { seconds });
        self.publish();
        Ok(())
    }

    async fn schedule_start(&mut self) -> Result<(), CoordinatorError> {
        if !self.is_host() {
            return Err(CoordinatorError::NotHost);
        }
        if self.phase != Phase::CountdownPending {
            return Err(CoordinatorError::InvalidState(self.phase));
        }

        // Target an instant slightly in the future rather than "now" so all
        // peers begin as close to simultaneously as the channel allows.
        let target_unix_ms =
            Utc::now().timestamp_millis() as u64 + self.config.start_buffer.as_millis() as u64;
        tracing::info!(session = %self.session_id, target_unix_ms, "start scheduled");

        self.broadcast(PeerMessage::Start { target_unix_ms }).await;
        self.pending_start = Some((instant_for_unix_ms(target_unix_ms), target_unix_ms));
        self.ack_deadline = Some(Instant::now() + self.config.ack_timeout);
        self.publish();
        Ok(())
    }

    /// The scheduled start instant arrived: begin capturing locally.
    async fn begin_local_capture(&mut self) {
        let Some((_, target_unix_ms)) = self.pending_start.take() else {
            return;
        };

        let actual_unix_ms = Utc::now().timestamp_millis();
        self.clock_offset = Some(SessionClockOffset {
            offset_ms: target_unix_ms as i64 - actual_unix_ms,
        });

        let key = RecordingKey::new(self.session_id.clone(), self.local_peer.clone());
        let writer = match self.store.writer(key) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(error = %e, "could not open chunk writer; recording skipped locally");
                let _ = self.events.send(CoordinatorEvent::CaptureFailed {
                    message: e.to_string(),
                });
                // No ack is sent, so the host will mark this peer skipped.
                return;
            }
        };

        let feed = (self.feeds)();
        self.capture = Some(LocalCapture::start(
            feed,
            writer,
            self.capture_config.clone(),
        ));
        self.recording_started_at = Some(std::time::Instant::now());
        self.phase = Phase::Recording;

        if self.is_host() {
            let local = self.local_peer.clone();
            self.set_peer_status(&local, PeerStatus::Recording);
        } else {
            let ack = PeerMessage::StartAck {
                actual_start_unix_ms: actual_unix_ms as u64,
            };
            if let Err(e) = self.channel.send(&self.host_peer, ack).await {
                tracing::warn!(error = %e, "could not ack start to host");
            }
        }

        tracing::info!(session = %self.session_id, offset = ?self.clock_offset, "recording started");
        let _ = self.events.send(CoordinatorEvent::Started);
        self.publish();
    }

    /// Host ack deadline passed: peers still counting down are skipped.
    fn expire_pending_acks(&mut self) {
        self.ack_deadline = None;
        let silent: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| **s == PeerStatus::CountingDown)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in silent {
            let error = CoordinatorError::PeerUnresponsive(peer.clone());
            tracing::warn!(%error, "recording skipped");
            self.set_peer_status(&peer, PeerStatus::Skipped);
            let _ = self.events.send(CoordinatorEvent::PeerSkipped {
                peer,
                reason: error.to_string(),
            });
        }
    }

    async fn stop_session(&mut self) -> Result<StopOutcome, CoordinatorError> {
        if !self.is_host() {
            return Err(CoordinatorError::NotHost);
        }
        if self.phase != Phase::Recording && self.pending_start.is_none() {
            return Err(CoordinatorError::InvalidState(self.phase));
        }

        tracing::info!(session = %self.session_id, "stopping session");
        self.broadcast(PeerMessage::Stop).await;
        Ok(self.stop_local().await)
    }

    /// Stop local capture, finalize, and move to `Stopped`.
    async fn stop_local(&mut self) -> StopOutcome {
        self.pending_start = None;
        self.ack_deadline = None;

        let duration_ms = self
            .recording_started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let artifact = match self.capture.take() {
            Some(handle) => match handle.stop().await {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    tracing::error!(error = %e, "local recording failed to finalize");
                    let _ = self.events.send(CoordinatorEvent::CaptureFailed {
                        message: e.to_string(),
                    });
                    None
                }
            },
            None => None,
        };

        self.phase = Phase::Stopped;
        let local = self.local_peer.clone();
        self.set_peer_status(&local, PeerStatus::Stopped);
        tracing::info!(session = %self.session_id, duration_ms, "recording stopped");
        let _ = self.events.send(CoordinatorEvent::Stopped {
            artifact: artifact.clone(),
            duration_ms,
        });
        self.publish();

        StopOutcome {
            artifact,
            duration_ms,
        }
    }

    async fn shutdown(&mut self) {
        if self.capture.is_some() {
            // Leaving mid-recording: finalize what we have so this peer
            // still contributes a (possibly truncated) artifact.
            tracing::warn!(session = %self.session_id, "shutdown during recording; finalizing truncated artifact");
            self.stop_local().await;
        }
    }

    async fn broadcast(&self, message: PeerMessage) {
        for peer in &self.roster {
            if *peer == self.local_peer {
                continue;
            }
            if let Err(e) = self.channel.send(peer, message.clone()).await {
                tracing::warn!(%peer, error = %e, "broadcast send failed");
            }
        }
    }

    fn set_peer_status(&mut self, peer: &PeerId, status: PeerStatus) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if *entry != status {
                *entry = status;
                let _ = self.events.send(CoordinatorEvent::PeerStateChanged {
                    peer: peer.clone(),
                    status,
                });
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            peers: self.peers.clone(),
            clock_offset: self.clock_offset,
        });
    }
}

/// Translate a wall-clock target into a local sleep deadline. A target
/// already in the past fires immediately.
fn instant_for_unix_ms(target_unix_ms: u64) -> Instant {
    let now_unix_ms = Utc::now().timestamp_millis();
    let delta_ms = (target_unix_ms as i64 - now_unix_ms).max(0) as u64;
    Instant::now() + Duration::from_millis(delta_ms)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedFeed;
    use crate::channel::{split_messages, MemoryHub};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn scripted_feeds() -> FeedFactory {
        Box::new(|| {
            Box::new(ScriptedFeed::new(vec![
                Bytes::from_static(b"aaaa"),
                Bytes::from_static(b"bbbb"),
            ])) as Box<dyn MediaFeed>
        })
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            start_buffer: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(300),
        }
    }

    struct TestPeer {
        handle: CoordinatorHandle,
        store: Arc<ChunkStore>,
        _dir: tempfile::TempDir,
    }

    fn spawn_peer(hub: &MemoryHub, session: &SessionId, peer: &str, roster: &[&str]) -> TestPeer {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let (channel, rx) = hub.connect(peer.into());
        let (control_rx, _transfer_rx) = split_messages(rx);
        let options = SessionOptions {
            session_id: session.clone(),
            host_peer: "host".into(),
            roster: roster.iter().map(|p| PeerId::new(*p)).collect(),
            config: fast_config(),
            capture: CaptureConfig::default(),
        };
        let handle = SessionCoordinator::spawn(
            options,
            Arc::new(channel),
            control_rx,
            Arc::clone(&store),
            scripted_feeds(),
        );
        TestPeer {
            handle,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn full_session_produces_artifacts_on_every_peer() {
        let hub = MemoryHub::new();
        let session = SessionId::generate();
        let roster = ["host", "a", "b"];
        let host = spawn_peer(&hub, &session, "host", &roster);
        let a = spawn_peer(&hub, &session, "a", &roster);
        let b = spawn_peer(&hub, &session, "b", &roster);

        host.handle.begin_countdown(3).await.unwrap();
        host.handle.start().await.unwrap();

        // Wait until the host sees everyone recording.
        host.handle
            .wait_for(|s| {
                s.phase == Phase::Recording
                    && s.peers.values().all(|p| *p == PeerStatus::Recording)
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = host.handle.stop().await.unwrap();
        assert!(outcome.artifact.is_some());

        for peer in [&a, &b] {
            peer.handle
                .wait_for(|s| s.phase == Phase::Stopped)
                .await
                .unwrap();
        }
        let key_a = RecordingKey::new(session.clone(), "a".into());
        let key_b = RecordingKey::new(session.clone(), "b".into());
        assert!(a.store.is_finalized(&key_a).unwrap());
        assert!(b.store.is_finalized(&key_b).unwrap());

        // Everyone derived an offset at start.
        assert!(a.handle.snapshot().clock_offset.is_some());

        host.handle.shutdown().await;
        a.handle.shutdown().await;
        b.handle.shutdown().await;
    }

    #[tokio::test]
    async fn silent_peer_is_skipped_and_session_continues() {
        let hub = MemoryHub::new();
        let session = SessionId::generate();
        // "ghost" is in the roster but never connects a coordinator.
        let roster = ["host", "a", "ghost"];
        let host = spawn_peer(&hub, &session, "host", &roster);
        let a = spawn_peer(&hub, &session, "a", &roster);

        let mut events = host.handle.subscribe();
        host.handle.begin_countdown(3).await.unwrap();
        host.handle.start().await.unwrap();

        host.handle
            .wait_for(|s| s.peers.get(&PeerId::new("ghost")) == Some(&PeerStatus::Skipped))
            .await
            .unwrap();

        // The skip surfaces as an event carrying the unresponsive-peer error.
        loop {
            match events.recv().await.unwrap() {
                CoordinatorEvent::PeerSkipped { peer, reason } => {
                    assert_eq!(peer, PeerId::new("ghost"));
                    assert!(reason.contains("did not acknowledge start"));
                    break;
                }
                _ => continue,
            }
        }
        // The live peer is unaffected by the ghost.
        assert_eq!(
            host.handle.snapshot().peers.get(&PeerId::new("a")),
            Some(&PeerStatus::Recording)
        );

        let outcome = host.handle.stop().await.unwrap();
        assert!(outcome.artifact.is_some());

        // The skipped peer contributed no artifact anywhere.
        let key_ghost = RecordingKey::new(session, "ghost".into());
        assert!(!host.store.is_finalized(&key_ghost).unwrap());

        host.handle.shutdown().await;
        a.handle.shutdown().await;
    }

    #[tokio::test]
    async fn non_host_cannot_drive_the_session() {
        let hub = MemoryHub::new();
        let session = SessionId::generate();
        let roster = ["host", "a"];
        let host = spawn_peer(&hub, &session, "host", &roster);
        let a = spawn_peer(&hub, &session, "a", &roster);

        assert!(matches!(
            a.handle.begin_countdown(3).await,
            Err(CoordinatorError::NotHost)
        ));
        assert!(matches!(a.handle.start().await, Err(CoordinatorError::NotHost)));

        // And the host cannot start without a countdown.
        assert!(matches!(
            host.handle.start().await,
            Err(CoordinatorError::InvalidState(Phase::Idle))
        ));

        host.handle.shutdown().await;
        a.handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_mid_recording_finalizes_truncated_artifact() {
        let hub = MemoryHub::new();
        let session = SessionId::generate();
        let roster = ["host", "a"];
        let host = spawn_peer(&hub, &session, "host", &roster);
        let a = spawn_peer(&hub, &session, "a", &roster);

        host.handle.begin_countdown(3).await.unwrap();
        host.handle.start().await.unwrap();
        a.handle
            .wait_for(|s| s.phase == Phase::Recording)
            .await
            .unwrap();

        // Peer drops out mid-recording.
        let key_a = RecordingKey::new(session.clone(), "a".into());
        a.handle.shutdown().await;
        assert!(a.store.is_finalized(&key_a).unwrap());

        host.handle.stop().await.unwrap();
        host.handle.shutdown().await;
    }
}
