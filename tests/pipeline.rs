//! End-to-end pipeline test: a three-peer session is recorded, the host
//! gathers artifacts over resumable transfers, and compositing is gated on
//! every required artifact having arrived. Everything runs in-process over
//! the memory hub; no encoder is invoked.

use anyhow::Result;
use bytes::Bytes;
use ensemble::capture::{CaptureConfig, MediaFeed, ScriptedFeed};
use ensemble::channel::{split_messages, MemoryChannel, MemoryHub};
use ensemble::composite::{
    CompositeEngine, CompositeError, CompositeLayout, CompositeRequest,
};
use ensemble::coordinator::{
    CoordinatorConfig, CoordinatorHandle, PeerStatus, Phase, SessionCoordinator, SessionOptions,
};
use ensemble::store::ChunkStore;
use ensemble::timeline::{EditDecisionList, TimelineRecorder};
use ensemble::transfer::{TransferConfig, TransferManager, TransferStatus};
use ensemble::types::{PeerId, RecordingKey, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Peer {
    id: PeerId,
    coordinator: CoordinatorHandle,
    transfers: TransferManager<MemoryChannel>,
    store: Arc<ChunkStore>,
    _dir: tempfile::TempDir,
}

fn spawn_peer(hub: &MemoryHub, session: &SessionId, name: &str, roster: &[&str]) -> Peer {
    let dir = tempdir().unwrap();
    let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
    let (channel, rx) = hub.connect(name.into());
    let channel = Arc::new(channel);
    let (control_rx, transfer_rx) = split_messages(rx);

    let coordinator = SessionCoordinator::spawn(
        SessionOptions {
            session_id: session.clone(),
            host_peer: "host".into(),
            roster: roster.iter().map(|p| PeerId::new(*p)).collect(),
            config: CoordinatorConfig {
                start_buffer: Duration::from_millis(50),
                ack_timeout: Duration::from_millis(500),
            },
            capture: CaptureConfig::default(),
        },
        Arc::clone(&channel),
        control_rx,
        Arc::clone(&store),
        Box::new(|| {
            Box::new(ScriptedFeed::new(vec![
                Bytes::from_static(b"frame-0"),
                Bytes::from_static(b"frame-1"),
            ])) as Box<dyn MediaFeed>
        }),
    );
    let transfers = TransferManager::spawn(
        Arc::clone(&store),
        channel,
        transfer_rx,
        TransferConfig::default(),
    );

    Peer {
        id: name.into(),
        coordinator,
        transfers,
        store,
        _dir: dir,
    }
}

async fn wait_job_complete(peer: &Peer, id: ensemble::transfer::JobId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let job = peer.transfers.job(id).unwrap();
        match job.status {
            TransferStatus::Complete => return,
            TransferStatus::Error { message } => panic!("transfer failed: {message}"),
            _ => {}
        }
        assert!(tokio::time::Instant::now() < deadline, "transfer stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn record_transfer_and_gate_composite_on_arrivals() -> Result<()> {
    let hub = MemoryHub::new();
    let session = SessionId::generate();
    let roster = ["host", "a", "b"];
    let host = spawn_peer(&hub, &session, "host", &roster);
    let a = spawn_peer(&hub, &session, "a", &roster);
    let b = spawn_peer(&hub, &session, "b", &roster);

    // Coordinated start and stop, with the host tracking focus changes.
    let mut timeline = TimelineRecorder::start();
    host.coordinator.begin_countdown(3).await?;
    host.coordinator.start().await?;
    host.coordinator
        .wait_for(|s| {
            s.phase == Phase::Recording && s.peers.values().all(|p| *p == PeerStatus::Recording)
        })
        .await?;

    use ensemble::timeline::TimelineEventKind;
    timeline.record_at(40, Some(a.id.clone()), TimelineEventKind::FocusChange);
    timeline.record_at(70, Some(b.id.clone()), TimelineEventKind::FocusChange);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = host.coordinator.stop().await?;
    assert!(outcome.artifact.is_some());
    let timeline = timeline.finish(outcome.duration_ms.max(100));

    for peer in [&a, &b] {
        peer.coordinator.wait_for(|s| s.phase == Phase::Stopped).await?;
    }

    // The timeline survives a restart between stop and compose.
    let timeline_path = host._dir.path().join("timeline.json");
    timeline.save(&timeline_path)?;
    let timeline = ensemble::timeline::Timeline::load(&timeline_path)?;
    let edl = EditDecisionList::from_timeline(&timeline, &host.id);
    assert!(edl.is_covering());

    // Only "a" has delivered its artifact so far; compositing with "b"
    // still outstanding must fail up front.
    let key_a = RecordingKey::new(session.clone(), a.id.clone());
    let job_a = a.transfers.push(key_a.clone(), host.id.clone())?;
    wait_job_complete(&a, job_a).await;
    assert!(host.store.is_finalized(&key_a)?);

    let engine = CompositeEngine::new(Arc::clone(&host.store), host.id.clone());
    let premature = engine.compose(CompositeRequest::new(
        session.clone(),
        edl.clone(),
        CompositeLayout::Focus,
        host._dir.path().join("out.mp4"),
    ));
    assert!(matches!(
        premature,
        Err(CompositeError::MissingArtifact(peer)) if peer == b.id
    ));

    // Once "b" delivers too, every EDL source resolves.
    let key_b = RecordingKey::new(session.clone(), b.id.clone());
    let job_b = b.transfers.push(key_b.clone(), host.id.clone())?;
    wait_job_complete(&b, job_b).await;
    for peer in edl.source_peers() {
        let key = RecordingKey::new(session.clone(), peer);
        assert!(host.store.artifact(&key).is_ok());
    }

    host.coordinator.shutdown().await;
    a.coordinator.shutdown().await;
    b.coordinator.shutdown().await;
    Ok(())
}
