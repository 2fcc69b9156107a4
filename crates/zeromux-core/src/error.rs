//! Error types for Zeromux Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for streamer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Streamer error types
///
/// The pipeline stage failures render the exact messages hosts match on;
/// the underlying cause is kept in the variant and logged where it occurs.
#[derive(Error, Debug)]
pub enum Error {
    // Pipeline stage errors
    #[error("Failed to download file.json")]
    MetadataFetch { reason: String },

    #[error("Invalid file.json: {0}")]
    InvalidMetadata(String),

    #[error("Can't create media source.")]
    SinkCreation { codec: String },

    #[error("Failed to download moov box.")]
    HeaderFetch { attempts: u32, reason: String },

    #[error("MP4 worker error.")]
    EngineSpawn { reason: String },

    #[error("Feed error: {0}")]
    Feed(String),

    // Transport errors
    #[error("Request failed: {url}: {reason}")]
    Transport { url: String, reason: String },

    #[cfg(feature = "http")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Byte stream errors
    #[error("Byte stream pulled before preload")]
    StreamNotPreloaded,

    #[error("Failed to fetch segment {index}: {reason}")]
    SegmentFetch { index: usize, reason: String },

    // Remux worker errors
    #[error("Remux failed: {0}")]
    Remux(String),

    #[error("Remux worker closed")]
    WorkerClosed,

    // Sink errors
    #[error("Append failed: {0}")]
    Append(String),

    #[error("Buffer quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    // Lifecycle errors
    #[error("Session closed")]
    SessionClosed,

    #[error("Pipeline cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error for a URL
    pub fn transport(url: impl ToString, reason: impl ToString) -> Self {
        Error::Transport {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        #[cfg(feature = "http")]
        if matches!(self, Error::Network(_)) {
            return true;
        }
        matches!(
            self,
            Error::Transport { .. } | Error::SegmentFetch { .. } | Error::QuotaExceeded { .. }
        )
    }

    /// Returns the error code for logs and host bindings
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::MetadataFetch { .. } => "METADATA_FETCH",
            Error::InvalidMetadata(_) => "INVALID_METADATA",
            Error::SinkCreation { .. } => "SINK_CREATION",
            Error::HeaderFetch { .. } => "HEADER_FETCH",
            Error::EngineSpawn { .. } => "ENGINE_SPAWN",
            Error::Feed(_) => "FEED",
            Error::Transport { .. } => "TRANSPORT",
            #[cfg(feature = "http")]
            Error::Network(_) => "NETWORK",
            Error::StreamNotPreloaded => "STREAM_NOT_PRELOADED",
            Error::SegmentFetch { .. } => "SEGMENT_FETCH",
            Error::Remux(_) => "REMUX",
            Error::WorkerClosed => "WORKER_CLOSED",
            Error::Append(_) => "APPEND",
            Error::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Error::SessionClosed => "SESSION_CLOSED",
            Error::Cancelled => "CANCELLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "JSON",
            Error::Url(_) => "URL",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }

    /// Wrap the error in the `{ "error": <message> }` envelope
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
        }
    }
}

/// Failure envelope handed across host boundaries.
///
/// The presence of the `error` key is the only discriminator; a payload
/// without it is a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    /// Check whether an arbitrary JSON payload is an error envelope
    pub fn is_envelope(value: &serde_json::Value) -> bool {
        value.get("error").is_some()
    }
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        err.envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_messages() {
        let err = Error::MetadataFetch {
            reason: "404".into(),
        };
        assert_eq!(err.to_string(), "Failed to download file.json");

        let err = Error::SinkCreation {
            codec: "video/webm".into(),
        };
        assert_eq!(err.to_string(), "Can't create media source.");

        let err = Error::HeaderFetch {
            attempts: 6,
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Failed to download moov box.");

        let err = Error::EngineSpawn {
            reason: "bad moov".into(),
        };
        assert_eq!(err.to_string(), "MP4 worker error.");
    }

    #[test]
    fn test_envelope_shape() {
        let err = Error::EngineSpawn {
            reason: "x".into(),
        };
        let json = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "MP4 worker error." }));
        assert!(ErrorEnvelope::is_envelope(&json));
        assert!(!ErrorEnvelope::is_envelope(&serde_json::json!({ "stream": 1 })));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::transport("http://a/b", "503").is_recoverable());
        assert!(!Error::SessionClosed.is_recoverable());
    }
}
