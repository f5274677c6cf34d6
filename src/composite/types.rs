//! Composite job types and configuration

use crate::store::StoreError;
use crate::timeline::EditDecisionList;
use crate::types::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// How the peers' recordings are arranged in the output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeLayout {
    /// One peer full-frame at a time, cutting on focus changes.
    Focus,
    /// Every available peer tiled for the whole duration.
    Grid,
    /// Dominant peer full-frame, runner-up inset bottom-right.
    Pip,
}

/// Container formats for the composite output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
}

impl OutputFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
        }
    }

    /// Get the FFmpeg video codec for this format
    pub fn video_codec(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "libx264",
            OutputFormat::Webm => "libvpx-vp9",
        }
    }

    pub fn audio_codec(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "aac",
            OutputFormat::Webm => "libopus",
        }
    }
}

/// Composite quality levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeQuality {
    Low,
    Medium,
    High,
    Lossless,
}

impl CompositeQuality {
    /// Get the CRF value for H.264/VP9 encoding
    /// Lower values = higher quality, larger files
    pub fn crf(&self) -> u8 {
        match self {
            CompositeQuality::Low => 28,
            CompositeQuality::Medium => 23,
            CompositeQuality::High => 18,
            // CRF 1 is "visually lossless" - no perceptible quality loss
            // CRF 0 (true lossless) has compatibility issues with yuv420p
            CompositeQuality::Lossless => 1,
        }
    }

    /// Get the FFmpeg preset for H.264 encoding
    pub fn h264_preset(&self) -> &'static str {
        match self {
            CompositeQuality::Low => "faster",
            CompositeQuality::Medium => "medium",
            CompositeQuality::High => "slow",
            CompositeQuality::Lossless => "veryslow",
        }
    }
}

/// One composite job.
#[derive(Debug, Clone)]
pub struct CompositeRequest {
    /// Session whose artifacts the EDL references.
    pub session_id: SessionId,
    pub edl: EditDecisionList,
    pub layout: CompositeLayout,
    pub output_path: PathBuf,
    pub format: OutputFormat,
    pub quality: CompositeQuality,
    /// Peers whose artifact may be absent without failing the job. A missing
    /// optional peer has its segments dropped (focus) or its tile omitted
    /// (grid, pip).
    pub optional_sources: Vec<PeerId>,
    /// Output width in pixels (None = derive from the sources)
    pub width: Option<u32>,
    /// Output height in pixels (None = derive from the sources)
    pub height: Option<u32>,
}

impl CompositeRequest {
    pub fn new(
        session_id: SessionId,
        edl: EditDecisionList,
        layout: CompositeLayout,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id,
            edl,
            layout,
            output_path: output_path.into(),
            format: OutputFormat::Mp4,
            quality: CompositeQuality::Medium,
            optional_sources: Vec::new(),
            width: None,
            height: None,
        }
    }
}

/// A finished composite.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeOutput {
    pub output_path: PathBuf,
    pub duration_ms: u64,
}

/// Composite errors
#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("no finalized artifact for peer {0}")]
    MissingArtifact(PeerId),

    #[error("encoder exited with {status}: {stderr_tail}")]
    EncoderFailure { status: String, stderr_tail: String },

    #[error("probe failed for {path}: {message}")]
    Probe { path: PathBuf, message: String },

    #[error("composite cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CompositeError> for String {
    fn from(e: CompositeError) -> String {
        e.to_string()
    }
}
