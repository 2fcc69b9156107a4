//! Zeromux Core - segmented MP4 streaming into a playback buffer
//!
//! This crate bootstraps and drives playback of a segmented stream:
//! - Metadata (`file.json`) download and segment index decoding
//! - Playback buffer allocation for a codec descriptor
//! - Header (moov box) download with fixed-delay retry
//! - Remux worker spawning and message-passing wiring
//! - Backpressure-aware feeding of remuxed chunks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Zeromux Core                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Transport   │  │ Playback Sink│  │ Remux Engine │          │
//! │  │  (GET+bust)  │  │ buffer+clock │  │   (worker)   │          │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │  Pipeline   │                              │
//! │                    │ Controller  │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐           │
//! │  │ Byte Stream  │─▶│  Feed Loop  │─▶│   Session    │           │
//! │  │   Source     │  │ backpressure│  │   Handle     │           │
//! │  └──────────────┘  └─────────────┘  └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod pipeline;
pub mod remux;
pub mod retry;
pub mod session;
pub mod sink;
pub mod stream;
pub mod transport;
pub mod types;

pub use config::{FeedPolicy, StreamerConfig};
pub use error::{Error, ErrorEnvelope, Result};
pub use events::{EventPolicy, StreamEvent, TriggerPoint};
pub use feed::Advance;
pub use pipeline::{
    open_stream, start_stream, Collaborators, Pipeline, PipelineHandle, StreamCallback,
    StreamOutcome,
};
pub use remux::{PassthroughRemuxer, RemuxEngine, RemuxWorker, Remuxer, WorkerEngine};
pub use retry::RetryPolicy;
pub use session::StreamerSession;
pub use sink::{MediaBuffer, MemorySink, MemorySinkConfig, PlaybackSink, SinkAttachment};
pub use stream::ByteStream;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{cache_bust, Transport};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log library initialization
pub fn init() {
    tracing::info!(version = VERSION, "Zeromux Core initialized");
}
