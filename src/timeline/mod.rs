//! Host-side timeline
//!
//! Records focus-switch events during an active recording and derives the
//! edit decision list that drives compositing.

pub mod edl;
pub mod recorder;

pub use edl::{EditDecisionList, Segment};
pub use recorder::{Timeline, TimelineEvent, TimelineEventKind, TimelineRecorder};
