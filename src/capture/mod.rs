//! Local media capture
//!
//! Turns a live media feed into ordered chunks and persists them through the
//! chunk store, without ever blocking the feed on persistence.

pub mod feed;
pub mod local;

pub use feed::{MediaFeed, ScriptedFeed};
pub use local::{CaptureConfig, CaptureError, CaptureHandle, LocalCapture};
