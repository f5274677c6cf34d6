//! Artifact transfer
//!
//! After a session stops, each non-host peer pushes its finalized artifact
//! to the host as a resumable job. Jobs run concurrently, each owning its
//! own cursor; progress reflects receiver-confirmed delivery, and a failed
//! job keeps its cursor so a retry resumes instead of restarting.

pub mod manager;
pub mod state;

pub use manager::TransferManager;
pub use state::{JobId, TransferConfig, TransferError, TransferEvent, TransferJob, TransferStatus};
