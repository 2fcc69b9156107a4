//! Playback sink abstraction
//!
//! A sink owns the platform playback buffer and the player surface whose
//! position and buffered ranges drive backpressure. [`MemorySink`] is a
//! headless implementation with a simulated clock.

use crate::{CodecDescriptor, Error, MediaChunk, Result, TimeRanges};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Identifier of the media source backing a buffer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaSourceId(pub String);

impl MediaSourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MediaSourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MediaSourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append target of the playback buffer
#[async_trait]
pub trait MediaBuffer: Send {
    /// Append a remuxed chunk
    async fn append(&mut self, chunk: MediaChunk) -> Result<()>;

    /// Evict buffered media in `[start, end)`
    async fn remove(&mut self, start: f64, end: f64) -> Result<()>;
}

/// Result of a successful buffer allocation
pub struct SinkAttachment {
    /// Media source handle
    pub source: MediaSourceId,
    /// Buffer receiving remuxed chunks
    pub buffer: Box<dyn MediaBuffer>,
    /// URL the player surface plays from
    pub playback_url: String,
}

impl std::fmt::Debug for SinkAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkAttachment")
            .field("source", &self.source)
            .field("playback_url", &self.playback_url)
            .finish_non_exhaustive()
    }
}

/// Player surface plus buffer factory
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Allocate a buffer for `codec`; `None` if the codec is unsupported
    async fn create_buffer(&self, codec: &CodecDescriptor) -> Option<SinkAttachment>;

    /// Current playback position in seconds
    fn current_position(&self) -> f64;

    /// Currently buffered ranges
    fn buffered_ranges(&self) -> TimeRanges;

    /// Notified whenever position or buffered ranges change
    fn change_notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Configuration for [`MemorySink`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySinkConfig {
    /// Accepted container MIME types; empty accepts everything
    pub supported_types: Vec<String>,
    /// Maximum bytes held at once
    pub quota_bytes: usize,
}

impl Default for MemorySinkConfig {
    fn default() -> Self {
        Self {
            supported_types: vec!["video/mp4".into(), "audio/mp4".into()],
            quota_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

#[derive(Debug, Clone)]
struct StoredChunk {
    start: f64,
    end: f64,
    bytes: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    chunks: Vec<StoredChunk>,
    init_segments: usize,
    appended: usize,
    bytes_used: usize,
    position: f64,
    playing: bool,
    buffers: usize,
}

impl MemoryState {
    fn ranges(&self) -> TimeRanges {
        TimeRanges::from_ranges(
            self.chunks
                .iter()
                .map(|c| crate::TimeRange::new(c.start, c.end)),
        )
    }
}

/// Snapshot of [`MemorySink`] counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySinkStats {
    pub appended_chunks: usize,
    pub init_segments: usize,
    pub bytes_used: usize,
    pub position: f64,
    pub playing: bool,
    pub buffered: TimeRanges,
}

/// Headless playback sink backed by memory and a simulated clock
#[derive(Clone)]
pub struct MemorySink {
    config: MemorySinkConfig,
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemorySink {
    pub fn new(config: MemorySinkConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn supports(&self, codec: &CodecDescriptor) -> bool {
        self.config.supported_types.is_empty()
            || self
                .config
                .supported_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(codec.mime_type()))
    }

    pub fn play(&self) {
        self.state().playing = true;
        self.notify.notify_waiters();
    }

    pub fn pause(&self) {
        self.state().playing = false;
    }

    /// Jump to `position`
    pub fn seek(&self, position: f64) {
        self.state().position = position.max(0.0);
        self.notify.notify_waiters();
    }

    /// Move the clock forward by `seconds` while playing.
    ///
    /// Playback never runs past the end of the buffered range it is in;
    /// returns the new position.
    pub fn tick(&self, seconds: f64) -> f64 {
        let position = {
            let mut state = self.state();
            if state.playing {
                let limit = state
                    .ranges()
                    .end_containing(state.position)
                    .unwrap_or(state.position);
                state.position = (state.position + seconds).min(limit);
            }
            state.position
        };
        self.notify.notify_waiters();
        position
    }

    pub fn stats(&self) -> MemorySinkStats {
        let state = self.state();
        MemorySinkStats {
            appended_chunks: state.appended,
            init_segments: state.init_segments,
            bytes_used: state.bytes_used,
            position: state.position,
            playing: state.playing,
            buffered: state.ranges(),
        }
    }

    /// Number of buffers allocated so far
    pub fn buffer_count(&self) -> usize {
        self.state().buffers
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(MemorySinkConfig::default())
    }
}

#[async_trait]
impl PlaybackSink for MemorySink {
    async fn create_buffer(&self, codec: &CodecDescriptor) -> Option<SinkAttachment> {
        if !self.supports(codec) {
            debug!(codec = %codec, "Codec not supported by memory sink");
            return None;
        }

        self.state().buffers += 1;
        let source = MediaSourceId::new();
        let playback_url = format!("blob:zeromux/{}", source);
        let buffer = MemoryBuffer {
            quota_bytes: self.config.quota_bytes,
            state: self.state.clone(),
            notify: self.notify.clone(),
        };

        Some(SinkAttachment {
            source,
            buffer: Box::new(buffer),
            playback_url,
        })
    }

    fn current_position(&self) -> f64 {
        self.state().position
    }

    fn buffered_ranges(&self) -> TimeRanges {
        self.state().ranges()
    }

    fn change_notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

struct MemoryBuffer {
    quota_bytes: usize,
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemoryBuffer {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MediaBuffer for MemoryBuffer {
    async fn append(&mut self, chunk: MediaChunk) -> Result<()> {
        let size = chunk.data.len();
        {
            let mut state = self.state();
            let available = self.quota_bytes.saturating_sub(state.bytes_used);
            if size > available {
                return Err(Error::QuotaExceeded {
                    needed: size,
                    available,
                });
            }

            state.bytes_used += size;
            state.appended += 1;
            if chunk.is_init {
                state.init_segments += 1;
            } else {
                state.chunks.push(StoredChunk {
                    start: chunk.start,
                    end: chunk.end,
                    bytes: size,
                });
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn remove(&mut self, start: f64, end: f64) -> Result<()> {
        let freed = {
            let mut state = self.state();
            let before = state.bytes_used;
            let mut freed = 0;
            state.chunks.retain(|c| {
                let evict = c.start >= start && c.end <= end;
                if evict {
                    freed += c.bytes;
                }
                !evict
            });
            state.bytes_used = before - freed;
            freed
        };
        if freed > 0 {
            debug!(start, end, freed, "Evicted buffered media");
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
