//! Composite engine
//!
//! Runs on the host once every artifact it needs has arrived. A job resolves
//! its sources against the chunk store, builds one filter graph for the
//! requested layout, and drives a single ffmpeg subprocess to completion.
//! Encodes are serialized: one at a time, queued jobs wait on the slot.

use crate::composite::ffmpeg::{self, MediaInfo, ProgressLine};
use crate::composite::types::{
    CompositeError, CompositeLayout, CompositeOutput, CompositeRequest,
};
use crate::store::ChunkStore;
use crate::timeline::Segment;
use crate::types::PeerId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const STDERR_TAIL_BYTES: usize = 4096;

/// One source artifact resolved for a job.
#[derive(Debug, Clone)]
struct SourceMedia {
    peer: PeerId,
    path: PathBuf,
    /// ffmpeg input index, assigned in resolution order.
    input_index: usize,
}

/// What a request composes down to once missing optional sources are
/// dropped. Built before any subprocess is spawned.
#[derive(Debug, Clone)]
struct CompositePlan {
    sources: Vec<SourceMedia>,
    /// Focus layouts only: the surviving segments in order.
    segments: Vec<Segment>,
}

/// Builds composite outputs from finalized artifacts in the host's store.
pub struct CompositeEngine {
    store: Arc<ChunkStore>,
    host: PeerId,
    /// Serializes encodes; ffmpeg jobs are resource-hungry.
    encode_slot: Arc<Mutex<()>>,
}

/// A running composite job.
pub struct CompositeTask {
    progress: watch::Receiver<f64>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<Result<CompositeOutput, CompositeError>>,
}

impl CompositeTask {
    /// Encoded fraction of the output duration, 0 to 1.
    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    pub fn progress_watch(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<CompositeOutput, CompositeError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(CompositeError::EncoderFailure {
                status: "panicked".to_string(),
                stderr_tail: e.to_string(),
            }),
        }
    }

    /// Kill the encoder, delete the partial output, and resolve the job as
    /// cancelled.
    pub async fn cancel(self) -> Result<CompositeOutput, CompositeError> {
        let _ = self.cancel.send(true);
        self.wait().await
    }
}

impl CompositeEngine {
    pub fn new(store: Arc<ChunkStore>, host: PeerId) -> Self {
        Self {
            store,
            host,
            encode_slot: Arc::new(Mutex::new(())),
        }
    }

    /// Start one composite job. Source validation happens up front: a peer
    /// named by the EDL with no finalized artifact fails here with
    /// `MissingArtifact` unless listed in `optional_sources`.
    pub fn compose(&self, request: CompositeRequest) -> Result<CompositeTask, CompositeError> {
        if request.edl.duration_ms == 0 {
            return Err(CompositeError::InvalidRequest(
                "edit decision list has zero duration".to_string(),
            ));
        }

        let plan = self.resolve_sources(&request)?;
        tracing::info!(
            host = %self.host,
            layout = ?request.layout,
            sources = plan.sources.len(),
            duration_ms = request.edl.duration_ms,
            "composite job starting"
        );

        let (progress_tx, progress_rx) = watch::channel(0.0);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let slot = Arc::clone(&self.encode_slot);
        let handle = tokio::spawn(async move {
            let _guard = slot.lock().await;
            run_job(request, plan, progress_tx, cancel_rx).await
        });

        Ok(CompositeTask {
            progress: progress_rx,
            cancel: cancel_tx,
            handle,
        })
    }

    /// Map every peer the EDL references to its finalized artifact. Missing
    /// optional peers are dropped: their segments for focus, their tile for
    /// grid and pip. A layout left with nothing to show is invalid.
    fn resolve_sources(&self, request: &CompositeRequest) -> Result<CompositePlan, CompositeError> {
        let mut sources = Vec::new();
        let mut available: HashMap<PeerId, usize> = HashMap::new();

        for peer in request.edl.source_peers() {
            let key = crate::types::RecordingKey::new(request.session_id.clone(), peer.clone());
            match self.store.artifact(&key) {
                Ok(artifact) => {
                    let input_index = sources.len();
                    available.insert(peer.clone(), input_index);
                    sources.push(SourceMedia {
                        peer,
                        path: artifact.path,
                        input_index,
                    });
                }
                Err(_) if request.optional_sources.contains(&peer) => {
                    tracing::warn!(%peer, "optional source missing; dropped from composite");
                }
                Err(_) => return Err(CompositeError::MissingArtifact(peer)),
            }
        }

        let segments: Vec<Segment> = request
            .edl
            .segments
            .iter()
            .filter(|s| available.contains_key(&s.source_peer))
            .cloned()
            .collect();

        let empty = match request.layout {
            CompositeLayout::Focus => segments.is_empty(),
            CompositeLayout::Grid | CompositeLayout::Pip => sources.is_empty(),
        };
        if empty {
            return Err(CompositeError::InvalidRequest(
                "no sources left to compose".to_string(),
            ));
        }

        Ok(CompositePlan { sources, segments })
    }
}

async fn run_job(
    request: CompositeRequest,
    plan: CompositePlan,
    progress: watch::Sender<f64>,
    mut cancel: watch::Receiver<bool>,
) -> Result<CompositeOutput, CompositeError> {
    if *cancel.borrow() {
        return Err(CompositeError::Cancelled);
    }

    // Probe every source before composing; a corrupt artifact fails the job
    // here rather than as an opaque encoder error.
    let mut infos: Vec<MediaInfo> = Vec::with_capacity(plan.sources.len());
    for source in &plan.sources {
        let info = ffmpeg::probe(&source.path).await?;
        tracing::info!(
            peer = %source.peer,
            width = info.width,
            height = info.height,
            duration_ms = info.duration_ms,
            "source probed"
        );
        infos.push(info);
    }

    let width = request
        .width
        .unwrap_or_else(|| infos.iter().map(|i| i.width).max().unwrap_or(DEFAULT_WIDTH))
        & !1;
    let height = request
        .height
        .unwrap_or_else(|| infos.iter().map(|i| i.height).max().unwrap_or(DEFAULT_HEIGHT))
        & !1;

    let filter = build_graph(&request, &plan, width, height);
    let paths: Vec<PathBuf> = plan.sources.iter().map(|s| s.path.clone()).collect();
    let args = ffmpeg::encode_args(&paths, &filter, &request);

    let mut child = ffmpeg::spawn_encoder(&args)?;
    let stdout = child.stdout.take().ok_or_else(|| {
        CompositeError::Io(std::io::Error::other("failed to capture ffmpeg stdout"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        CompositeError::Io(std::io::Error::other("failed to capture ffmpeg stderr"))
    })?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf).await;
        let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).into_owned()
    });

    let duration_us = request.edl.duration_ms.saturating_mul(1000);
    let mut lines = BufReader::new(stdout).lines();

    let status = loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    tracing::info!("composite cancelled; killing encoder");
                    let _ = child.kill().await;
                    stderr_task.abort();
                    if request.output_path.exists() {
                        let _ = tokio::fs::remove_file(&request.output_path).await;
                    }
                    return Err(CompositeError::Cancelled);
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match ffmpeg::parse_progress_line(&line) {
                            Some(ProgressLine::OutTimeUs(us)) if duration_us > 0 => {
                                let fraction = (us as f64 / duration_us as f64).min(1.0);
                                let _ = progress.send(fraction);
                            }
                            Some(ProgressLine::End) => {
                                let _ = progress.send(1.0);
                            }
                            _ => {}
                        }
                    }
                    // stdout closed; the encoder is done, collect its status
                    Ok(None) | Err(_) => break child.wait().await?,
                }
            }
        }
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();
    if !status.success() {
        tracing::error!(%status, "encoder failed");
        return Err(CompositeError::EncoderFailure {
            status: status.to_string(),
            stderr_tail,
        });
    }

    let _ = progress.send(1.0);
    tracing::info!(output = %request.output_path.display(), "composite finished");
    Ok(CompositeOutput {
        output_path: request.output_path,
        duration_ms: request.edl.duration_ms,
    })
}

fn build_graph(request: &CompositeRequest, plan: &CompositePlan, width: u32, height: u32) -> String {
    let indices: Vec<usize> = plan.sources.iter().map(|s| s.input_index).collect();
    match request.layout {
        CompositeLayout::Focus => {
            let inputs: HashMap<PeerId, usize> = plan
                .sources
                .iter()
                .map(|s| (s.peer.clone(), s.input_index))
                .collect();
            ffmpeg::build_focus_graph(&plan.segments, &inputs, width, height)
        }
        CompositeLayout::Grid => ffmpeg::build_grid_graph(&indices, width, height),
        CompositeLayout::Pip => {
            // Dominant source by EDL screen time; runner-up inset.
            let by_index: HashMap<&PeerId, usize> = plan
                .sources
                .iter()
                .map(|s| (&s.peer, s.input_index))
                .collect();
            let mut ranked = request
                .edl
                .sources_by_screen_time()
                .into_iter()
                .filter_map(|(peer, _)| by_index.get(&peer).copied());
            let main = ranked.next().unwrap_or(0);
            let inset = ranked.next();
            ffmpeg::build_pip_graph(main, inset, width, height)
        }
    }
}
