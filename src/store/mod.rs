//! Durable chunk storage
//!
//! Append-only persistence for recording chunks, with finalize-to-artifact,
//! listing, deletion, and restart recovery. One writer per recording key.

pub mod chunk_store;

pub use chunk_store::{
    ArtifactInfo, ChunkStore, ChunkWriter, RecordingEntry, StoreError,
};
