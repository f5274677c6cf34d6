//! Ensemble - peer-to-peer session recording, made durable.
//!
//! Every peer records itself locally while a host coordinates start/stop
//! over an ordered message channel; finished recordings stream to the host
//! as resumable chunk transfers, and the host composites the gathered
//! artifacts into a single video driven by the focus timeline.
//!
//! The pipeline, stage by stage:
//! - [`coordinator`] agrees on a shared start instant and drives the
//!   session state machine on every peer.
//! - [`capture`] drains a local media feed into the store without ever
//!   blocking on disk.
//! - [`store`] keeps recordings as contiguous chunks and finalizes them
//!   into single-file artifacts.
//! - [`timeline`] records who was on screen when, and flattens that into an
//!   edit decision list.
//! - [`transfer`] moves finalized artifacts to the host, resuming from the
//!   receiver's cursor after any interruption.
//! - [`composite`] renders the final video with one ffmpeg pass per job.

pub mod capture;
pub mod channel;
pub mod composite;
pub mod coordinator;
pub mod store;
pub mod timeline;
pub mod transfer;
pub mod types;
pub mod utils;

pub use utils::error::{PipelineError, PipelineResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for binaries and integration tests. Respects
/// `RUST_LOG`; defaults to debug for this crate.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ensemble=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
