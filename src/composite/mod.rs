//! Compositing finalized artifacts into a single output video
//!
//! The host's last step: an edit decision list plus the gathered artifacts
//! go in, one ffmpeg invocation later a focus-cut, grid, or
//! picture-in-picture video comes out.

mod engine;
mod ffmpeg;
mod types;

pub use engine::{CompositeEngine, CompositeTask};
pub use ffmpeg::MediaInfo;
pub use types::{
    CompositeError, CompositeLayout, CompositeOutput, CompositeQuality, CompositeRequest,
    OutputFormat,
};
