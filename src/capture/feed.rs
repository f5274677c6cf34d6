//! Media feed seam
//!
//! The platform capture layer (screen, camera, microphone mux) sits behind
//! this trait; the pipeline only sees opaque, already-encoded chunks.

use async_trait::async_trait;
use bytes::Bytes;

/// A live source of media chunks.
///
/// Implementations slice their media into fixed-duration chunks (about one
/// second each) and yield them in order. Returning `None` means the feed has
/// ended and no further chunks will be produced.
#[async_trait]
pub trait MediaFeed: Send + 'static {
    async fn next_chunk(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl MediaFeed for Box<dyn MediaFeed> {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        (**self).next_chunk().await
    }
}

/// Feed over a fixed list of chunks. Handy for tests and replays.
pub struct ScriptedFeed {
    chunks: std::vec::IntoIter<Bytes>,
}

impl ScriptedFeed {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter(),
        }
    }
}

#[async_trait]
impl MediaFeed for ScriptedFeed {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        self.chunks.next()
    }
}
