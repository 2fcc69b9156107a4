//! Streamer Session - the live set of resources for one playback attempt
//!
//! Published by the pipeline only once sink, header and remux worker are
//! all established. Callers read state through the accessors; the buffer
//! itself stays owned by the feed loop.

use crate::{
    feed::{Advance, Feeder},
    sink::{MediaSourceId, PlaybackSink},
    stream::ByteStream,
    Error, Result, SessionId, TimeRanges,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct SessionInner {
    id: SessionId,
    source: MediaSourceId,
    playback_url: String,
    sink: Arc<dyn PlaybackSink>,
    stream: Arc<ByteStream>,
    feeder: Arc<Feeder>,
    token: CancellationToken,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle onto a running stream.
///
/// Cheap to clone. Dropping handles leaves feeding running; it stops once
/// the stream is drained, feeding fails, [`close`](Self::close) is called
/// or the owning pipeline is cancelled.
#[derive(Clone)]
pub struct StreamerSession {
    inner: Arc<SessionInner>,
}

impl StreamerSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        source: MediaSourceId,
        playback_url: String,
        sink: Arc<dyn PlaybackSink>,
        stream: Arc<ByteStream>,
        feeder: Arc<Feeder>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                source,
                playback_url,
                sink,
                stream,
                feeder,
                token,
                feed_task: Mutex::new(None),
            }),
        }
    }

    /// Token stopping this session's feed loop
    pub(crate) fn feed_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn attach_feed_task(&self, task: JoinHandle<()>) {
        let mut slot = self.inner.feed_task.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_closed() {
            task.abort();
            return;
        }
        *slot = Some(task);
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// URL the player surface plays from
    pub fn playback_url(&self) -> &str {
        &self.inner.playback_url
    }

    /// Media source backing the playback buffer
    pub fn media_source(&self) -> &MediaSourceId {
        &self.inner.source
    }

    /// Current playback position in seconds
    pub fn current_position(&self) -> f64 {
        self.inner.sink.current_position()
    }

    /// Currently buffered ranges
    pub fn buffered_ranges(&self) -> TimeRanges {
        self.inner.sink.buffered_ranges()
    }

    /// The byte stream, for pausing and resuming emission
    pub fn stream(&self) -> &ByteStream {
        &self.inner.stream
    }

    /// Push the next unit of work; a no-op when the sink is saturated,
    /// the stream is paused or the stream is drained
    pub async fn advance(&self) -> Result<Advance> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.inner.feeder.advance().await
    }

    /// Segments appended to the playback buffer so far
    pub fn segments_fed(&self) -> usize {
        self.inner.feeder.segments_fed()
    }

    /// True once every segment has been appended
    pub fn is_complete(&self) -> bool {
        self.inner.feeder.is_exhausted()
    }

    /// Feed failure, if feeding stopped on an error
    pub fn failure(&self) -> Option<String> {
        self.inner.feeder.failure()
    }

    /// True while the background feed loop is still scheduled
    pub fn is_feeding(&self) -> bool {
        self.inner
            .feed_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop feeding and fetching
    pub fn close(&self) {
        if self.inner.token.is_cancelled() {
            return;
        }
        info!(session_id = %self.inner.id, "Closing session");
        self.inner.token.cancel();
        self.inner.stream.close();
        if let Some(task) = self
            .inner
            .feed_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

impl std::fmt::Debug for StreamerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerSession")
            .field("id", &self.inner.id)
            .field("playback_url", &self.inner.playback_url)
            .field("stream", &self.inner.stream)
            .field("closed", &self.is_closed())
            .finish()
    }
}
