//! Timeline recorder
//!
//! Owned by the host while a recording is active. The UI layer pushes focus
//! notifications through plain method calls; the recorder stamps them
//! relative to the recording start and keeps the sequence monotonic by
//! construction rather than by re-sorting.

use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Instant;

/// What kind of edit decision an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimelineEventKind {
    FocusChange,
    ScreenShareStart,
    ScreenShareEnd,
}

/// One time-stamped edit decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Milliseconds since recording start; non-decreasing across the
    /// sequence.
    pub timestamp_ms: u64,
    /// Peer in focus after this event; `None` means the host's own view.
    pub focused_peer: Option<PeerId>,
    pub kind: TimelineEventKind,
}

/// Collects timeline events while the session records.
pub struct TimelineRecorder {
    started_at: Instant,
    events: Vec<TimelineEvent>,
}

impl TimelineRecorder {
    /// Start a timeline. Seeds the implicit event at t=0 focused on the
    /// host's own view.
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
            events: vec![TimelineEvent {
                timestamp_ms: 0,
                focused_peer: None,
                kind: TimelineEventKind::FocusChange,
            }],
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Record a focus switch stamped with the current instant.
    pub fn record_focus(&mut self, focused_peer: Option<PeerId>) {
        let now = self.elapsed_ms();
        self.record_at(now, focused_peer, TimelineEventKind::FocusChange);
    }

    pub fn screen_share_started(&mut self, peer: PeerId) {
        let now = self.elapsed_ms();
        self.record_at(now, Some(peer), TimelineEventKind::ScreenShareStart);
    }

    pub fn screen_share_ended(&mut self, peer: PeerId) {
        let now = self.elapsed_ms();
        self.record_at(now, Some(peer), TimelineEventKind::ScreenShareEnd);
    }

    /// Record an event with an explicit timestamp (UI layers that stamp
    /// their own notifications use this). An event that would move backwards
    /// in time is ignored, not re-ordered.
    pub fn record_at(
        &mut self,
        timestamp_ms: u64,
        focused_peer: Option<PeerId>,
        kind: TimelineEventKind,
    ) {
        let last = self.events.last().map(|e| e.timestamp_ms).unwrap_or(0);
        if timestamp_ms < last {
            tracing::debug!(
                timestamp_ms,
                last,
                "ignoring timeline event behind the last recorded one"
            );
            return;
        }
        self.events.push(TimelineEvent {
            timestamp_ms,
            focused_peer,
            kind,
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Freeze the timeline at the recording's final duration. Events stamped
    /// at or past the end carry no visible segment and are dropped.
    pub fn finish(self, duration_ms: u64) -> Timeline {
        let events = self
            .events
            .into_iter()
            .filter(|e| e.timestamp_ms < duration_ms || e.timestamp_ms == 0)
            .collect();
        Timeline {
            duration_ms,
            events,
        }
    }
}

/// A finished, immutable timeline for one recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub duration_ms: u64,
    pub events: Vec<TimelineEvent>,
}

impl Timeline {
    /// Persist as JSON so a host restart between stop and compose keeps the
    /// edit decisions.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
