//! Edit decision list
//!
//! Derived from a finished timeline by pairing consecutive events: segment
//! `i` spans from event `i` to event `i+1` (or to the recording end for the
//! last), attributed to the peer event `i` put in focus. The result covers
//! `[0, duration)` with no gaps and no overlaps.

use super::recorder::Timeline;
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One composited span sourced from a single peer's recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub source_peer: PeerId,
    /// Offset into the source peer's recording, in milliseconds.
    pub start_offset_ms: u64,
    pub duration_ms: u64,
}

impl Segment {
    pub fn end_offset_ms(&self) -> u64 {
        self.start_offset_ms + self.duration_ms
    }
}

/// Ordered, gapless, non-overlapping segments covering the whole recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditDecisionList {
    pub duration_ms: u64,
    pub segments: Vec<Segment>,
}

impl EditDecisionList {
    /// Build the EDL for a timeline. `host_peer` substitutes for the null
    /// (self-view) focus target.
    pub fn from_timeline(timeline: &Timeline, host_peer: &PeerId) -> Self {
        let mut segments = Vec::new();
        let events = &timeline.events;

        for (i, event) in events.iter().enumerate() {
            let start = event.timestamp_ms;
            let end = events
                .get(i + 1)
                .map(|next| next.timestamp_ms)
                .unwrap_or(timeline.duration_ms);
            if end <= start {
                // Superseded in the same instant; contributes nothing.
                continue;
            }
            let source_peer = event.focused_peer.clone().unwrap_or_else(|| host_peer.clone());
            segments.push(Segment {
                source_peer,
                start_offset_ms: start,
                duration_ms: end - start,
            });
        }

        Self {
            duration_ms: timeline.duration_ms,
            segments,
        }
    }

    /// Distinct source peers, in order of first appearance.
    pub fn source_peers(&self) -> Vec<PeerId> {
        let mut seen = Vec::new();
        for segment in &self.segments {
            if !seen.contains(&segment.source_peer) {
                seen.push(segment.source_peer.clone());
            }
        }
        seen
    }

    /// Source peers ranked by total on-screen time, descending. Ties break
    /// by first appearance. Drives the pip primary/secondary choice.
    pub fn sources_by_screen_time(&self) -> Vec<(PeerId, u64)> {
        let mut totals: HashMap<PeerId, u64> = HashMap::new();
        for segment in &self.segments {
            *totals.entry(segment.source_peer.clone()).or_default() += segment.duration_ms;
        }
        let mut ranked: Vec<(PeerId, u64)> = self
            .source_peers()
            .into_iter()
            .map(|peer| {
                let total = totals.get(&peer).copied().unwrap_or(0);
                (peer, total)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    /// Whether the segments exactly cover `[0, duration)` without gaps or
    /// overlaps.
    pub fn is_covering(&self) -> bool {
        let mut cursor = 0;
        for segment in &self.segments {
            if segment.start_offset_ms != cursor || segment.duration_ms == 0 {
                return false;
            }
            cursor = segment.end_offset_ms();
        }
        cursor == self.duration_ms
    }
}
