//! Feed loop - moves remuxed output into the playback buffer
//!
//! Handles:
//! - Backpressure against the buffered horizon ahead of playback
//! - Back-buffer eviction behind the playback position
//! - Self-rescheduling on a timer or sink change notification
//! - Single delivery of feed failures

use crate::{
    config::FeedPolicy,
    pipeline::Completion,
    remux::RemuxWorker,
    sink::{MediaBuffer, PlaybackSink},
    stream::ByteStream,
    Error, MediaChunk, Result, SessionId, TimeRanges,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

/// Outcome of one advance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    /// One segment was remuxed and its chunks appended
    Appended { segment: usize, chunks: usize },
    /// The sink has no spare capacity; nothing was done
    Saturated { ahead: f64 },
    /// The byte stream is paused; nothing was done
    Paused,
    /// The byte stream is drained; nothing left to do
    Exhausted,
}

struct FeedState {
    worker: RemuxWorker,
    buffer: Box<dyn MediaBuffer>,
}

/// Owner of the playback buffer while a session is live
pub struct Feeder {
    session: SessionId,
    sink: Arc<dyn PlaybackSink>,
    stream: Arc<ByteStream>,
    policy: FeedPolicy,
    state: Mutex<FeedState>,
    exhausted: AtomicBool,
    segments: AtomicUsize,
    chunks: AtomicUsize,
    failure: StdMutex<Option<String>>,
    completion: Completion,
}

impl Feeder {
    pub(crate) fn new(
        session: SessionId,
        sink: Arc<dyn PlaybackSink>,
        stream: Arc<ByteStream>,
        buffer: Box<dyn MediaBuffer>,
        worker: RemuxWorker,
        policy: FeedPolicy,
        completion: Completion,
    ) -> Self {
        Self {
            session,
            sink,
            stream,
            policy,
            state: Mutex::new(FeedState { worker, buffer }),
            exhausted: AtomicBool::new(false),
            segments: AtomicUsize::new(0),
            chunks: AtomicUsize::new(0),
            failure: StdMutex::new(None),
            completion,
        }
    }

    /// Push the next unit of work if the sink has room.
    ///
    /// Invocations are serialized. While the byte stream is paused every
    /// call returns [`Advance::Paused`]; once the stream is exhausted every
    /// call is a no-op returning [`Advance::Exhausted`]; once feeding failed
    /// every call returns the same [`Error::Feed`].
    pub async fn advance(&self) -> Result<Advance> {
        let mut state = self.state.lock().await;

        if let Some(reason) = self.failure() {
            return Err(Error::Feed(reason));
        }
        if self.is_exhausted() {
            return Ok(Advance::Exhausted);
        }

        match self.step(&mut state).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let reason = e.to_string();
                error!(
                    session_id = %self.session,
                    code = e.error_code(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Feeding failed"
                );
                *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason.clone());
                self.completion.deliver(Err(Error::Feed(reason.clone())));
                Err(Error::Feed(reason))
            }
        }
    }

    async fn step(&self, state: &mut FeedState) -> Result<Advance> {
        let position = self.sink.current_position();
        let ranges = self.sink.buffered_ranges();

        self.evict_behind(state, position, &ranges).await?;

        let ahead = ranges.buffered_ahead(position);
        if ahead >= self.policy.ahead_horizon {
            trace!(position, ahead, "Sink saturated");
            return Ok(Advance::Saturated { ahead });
        }
        if self.stream.is_paused() {
            return Ok(Advance::Paused);
        }

        // a pause while waiting for the next segment turns this into a no-op
        let pulled = tokio::select! {
            biased;
            pulled = self.stream.pull() => pulled?,
            _ = self.stream.wait_until_paused() => return Ok(Advance::Paused),
        };

        let Some(segment) = pulled else {
            let tail = state.worker.finish().await?;
            self.append_all(state, tail).await?;
            self.exhausted.store(true, Ordering::SeqCst);
            info!(
                session_id = %self.session,
                segments = self.segments_fed(),
                chunks = self.chunks.load(Ordering::SeqCst),
                "Feeding complete"
            );
            return Ok(Advance::Exhausted);
        };

        let index = segment.descriptor.index;
        let chunks = state.worker.remux(segment).await?;
        let count = chunks.len();
        self.append_all(state, chunks).await?;
        self.segments.fetch_add(1, Ordering::SeqCst);

        debug!(segment = index, chunks = count, position, ahead, "Segment appended");
        Ok(Advance::Appended {
            segment: index,
            chunks: count,
        })
    }

    async fn append_all(&self, state: &mut FeedState, chunks: Vec<MediaChunk>) -> Result<()> {
        for chunk in chunks {
            state.buffer.append(chunk).await?;
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn evict_behind(&self, state: &mut FeedState, position: f64, ranges: &TimeRanges) -> Result<()> {
        let cutoff = position - self.policy.back_buffer;
        match ranges.start() {
            Some(start) if cutoff > start => {
                debug!(start, cutoff, "Evicting back buffer");
                state.buffer.remove(start, cutoff).await
            }
            _ => Ok(()),
        }
    }

    /// Failure reason once feeding has failed
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Segments appended so far
    pub fn segments_fed(&self) -> usize {
        self.segments.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}

/// Run the feed loop until the stream is drained, feeding fails or
/// `token` is cancelled
pub(crate) fn spawn_feed_loop(feeder: Arc<Feeder>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run_feed_loop(feeder, token))
}

#[instrument(skip_all, fields(session_id = %feeder.session))]
async fn run_feed_loop(feeder: Arc<Feeder>, token: CancellationToken) {
    let notifier = feeder.sink.change_notifier();
    let idle = feeder.policy.idle_interval();

    loop {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = feeder.advance() => outcome,
        };

        match outcome {
            Ok(Advance::Appended { .. }) => tokio::task::yield_now().await,
            Ok(Advance::Saturated { .. }) => {
                let changed = async {
                    match &notifier {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = changed => {}
                    _ = sleep(idle) => {}
                }
            }
            Ok(Advance::Paused) => {
                trace!("Byte stream paused, waiting for resume");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = feeder.stream.wait_until_resumed() => {}
                }
            }
            Ok(Advance::Exhausted) => break,
            Err(_) => break,
        }
    }
    debug!("Feed loop stopped");
}
