//! Core types for Zeromux

use crate::{events::EventPolicy, Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a streamer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MIME type plus codec list, e.g. `video/mp4; codecs="avc1.64001f, mp4a.40.2"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecDescriptor(String);

impl CodecDescriptor {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The container MIME type (everything before the first `;`)
    pub fn mime_type(&self) -> &str {
        self.0.split(';').next().unwrap_or_default().trim()
    }

    /// Individual codec strings from the `codecs="..."` parameter
    pub fn codecs(&self) -> Vec<&str> {
        self.0
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("codecs="))
            .flat_map(|list| list.trim_matches('"').split(','))
            .map(str::trim)
            .filter(|codec| !codec.is_empty())
            .collect()
    }
}

impl std::fmt::Display for CodecDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecDescriptor {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Arguments for one stream playback attempt.
///
/// Built by the caller before any download starts and never mutated by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct StreamArgs {
    /// Location of the metadata resource (`file.json`)
    pub metadata_url: Url,
    /// Location of the binary stream header (moov box)
    pub header_url: Url,
    /// Codec descriptor the playback buffer is created for
    pub codec: CodecDescriptor,
    /// Event policy for the byte stream; the default policy is used if absent
    pub events: Option<EventPolicy>,
}

impl StreamArgs {
    pub fn new(metadata_url: Url, header_url: Url, codec: impl Into<CodecDescriptor>) -> Self {
        Self {
            metadata_url,
            header_url,
            codec: codec.into(),
            events: None,
        }
    }

    /// Attach user event callbacks
    pub fn with_events(mut self, events: EventPolicy) -> Self {
        self.events = Some(events);
        self
    }
}

/// A contiguous buffered interval, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start && position < self.end
    }
}

/// Ordered, non-overlapping set of buffered intervals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeRanges(Vec<TimeRange>);

/// Gap below which two ranges are treated as contiguous
const CONTIGUOUS_EPSILON: f64 = 0.1;

impl TimeRanges {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from arbitrary intervals, merging overlaps and near-contiguous ones
    pub fn from_ranges(ranges: impl IntoIterator<Item = TimeRange>) -> Self {
        let mut sorted: Vec<TimeRange> = ranges
            .into_iter()
            .filter(|r| r.end > r.start)
            .collect();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end + CONTIGUOUS_EPSILON => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Self(merged)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.0.iter()
    }

    /// Earliest buffered time
    pub fn start(&self) -> Option<f64> {
        self.0.first().map(|r| r.start)
    }

    /// Latest buffered time
    pub fn end(&self) -> Option<f64> {
        self.0.last().map(|r| r.end)
    }

    /// End of the range that contains `position`
    pub fn end_containing(&self, position: f64) -> Option<f64> {
        self.0
            .iter()
            .find(|r| r.contains(position))
            .map(|r| r.end)
    }

    /// Seconds of media buffered contiguously ahead of `position`
    pub fn buffered_ahead(&self, position: f64) -> f64 {
        self.end_containing(position)
            .map(|end| end - position)
            .unwrap_or(0.0)
    }

    /// Total buffered seconds
    pub fn total(&self) -> f64 {
        self.0.iter().map(TimeRange::duration).sum()
    }
}

impl From<Vec<(f64, f64)>> for TimeRanges {
    fn from(ranges: Vec<(f64, f64)>) -> Self {
        Self::from_ranges(ranges.into_iter().map(|(s, e)| TimeRange::new(s, e)))
    }
}

/// One remuxed unit ready to be appended to the playback buffer
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    /// Container bytes
    pub data: Bytes,
    /// Presentation start in seconds
    pub start: f64,
    /// Presentation end in seconds
    pub end: f64,
    /// Initialization data (no media time)
    pub is_init: bool,
}

impl MediaChunk {
    pub fn init(data: Bytes) -> Self {
        Self {
            data,
            start: 0.0,
            end: 0.0,
            is_init: true,
        }
    }

    pub fn media(data: Bytes, start: f64, end: f64) -> Self {
        Self {
            data,
            start,
            end,
            is_init: false,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Entry of the segment index in `file.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentEntry {
    /// Segment location, relative to the metadata resource
    pub path: String,
    /// Duration in seconds
    pub duration: f64,
    /// Size in bytes, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The segment index, element `[1]` of `file.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentIndex(pub Vec<SegmentEntry>);

impl SegmentIndex {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total duration in seconds
    pub fn duration(&self) -> f64 {
        self.0.iter().map(|e| e.duration).sum()
    }

    /// Resolve entries against `base`, assigning timeline positions
    pub fn resolve(&self, base: &Url) -> Result<Vec<SegmentDescriptor>> {
        let mut start = 0.0;
        self.0
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let url = base.join(&entry.path)?;
                let descriptor = SegmentDescriptor {
                    index,
                    url,
                    start,
                    duration: entry.duration,
                    size: entry.size,
                };
                start += entry.duration;
                Ok(descriptor)
            })
            .collect()
    }
}

/// A resolved, fetchable segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Position in the segment index
    pub index: usize,
    /// Absolute location
    pub url: Url,
    /// Timeline start in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Size in bytes, if known
    pub size: Option<u64>,
}

impl SegmentDescriptor {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Raw segment bytes as produced by the byte stream
#[derive(Debug, Clone)]
pub struct RawSegment {
    pub descriptor: SegmentDescriptor,
    pub data: Bytes,
}

/// Decoded metadata resource
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The whole decoded document
    pub document: serde_json::Value,
    /// The segment index entry
    pub segments: SegmentIndex,
}

/// Position of the segment index inside the `file.json` array
const SEGMENT_INDEX_SLOT: usize = 1;

impl Metadata {
    /// Decode the text of `file.json`
    pub fn parse(text: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidMetadata(e.to_string()))?;

        let slot = document
            .as_array()
            .and_then(|items| items.get(SEGMENT_INDEX_SLOT))
            .ok_or_else(|| Error::InvalidMetadata("missing segment index entry".into()))?;

        let segments: SegmentIndex = serde_json::from_value(slot.clone())
            .map_err(|e| Error::InvalidMetadata(format!("segment index: {e}")))?;

        Ok(Self { document, segments })
    }
}

/// Pipeline controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Init,
    MetadataFetching,
    SinkCreating,
    HeaderFetching,
    EngineSpawning,
    Feeding,
    Running,
    Failed,
    Cancelled,
}

impl PipelineStage {
    /// Check if transition to target stage is valid
    pub fn can_transition_to(&self, target: PipelineStage) -> bool {
        use PipelineStage::*;
        matches!(
            (self, target),
            (Init, MetadataFetching)
                | (MetadataFetching, SinkCreating)
                | (SinkCreating, HeaderFetching)
                | (HeaderFetching, EngineSpawning)
                | (EngineSpawning, Feeding)
                | (Feeding, Running)
                | (Init | MetadataFetching | SinkCreating | HeaderFetching | EngineSpawning | Feeding, Failed)
                | (Init | MetadataFetching | SinkCreating | HeaderFetching | EngineSpawning | Feeding, Cancelled)
        )
    }

    /// True once the controller has nothing left to do
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Running | PipelineStage::Failed | PipelineStage::Cancelled
        )
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Init => write!(f, "init"),
            PipelineStage::MetadataFetching => write!(f, "metadata_fetching"),
            PipelineStage::SinkCreating => write!(f, "sink_creating"),
            PipelineStage::HeaderFetching => write!(f, "header_fetching"),
            PipelineStage::EngineSpawning => write!(f, "engine_spawning"),
            PipelineStage::Feeding => write!(f, "feeding"),
            PipelineStage::Running => write!(f, "running"),
            PipelineStage::Failed => write!(f, "failed"),
            PipelineStage::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_descriptor() {
        let codec = CodecDescriptor::new(r#"video/mp4; codecs="avc1.64001f, mp4a.40.2""#);
        assert_eq!(codec.mime_type(), "video/mp4");
        assert_eq!(codec.codecs(), vec!["avc1.64001f", "mp4a.40.2"]);

        let bare = CodecDescriptor::new("video/mp4");
        assert!(bare.codecs().is_empty());
    }

    #[test]
    fn test_time_ranges_merge() {
        let ranges = TimeRanges::from(vec![(4.0, 8.0), (0.0, 4.05), (10.0, 12.0)]);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges.start(), Some(0.0));
        assert_eq!(ranges.end(), Some(12.0));
        assert_eq!(ranges.total(), 10.0);
    }

    #[test]
    fn test_buffered_ahead() {
        let ranges = TimeRanges::from(vec![(0.0, 6.0), (10.0, 20.0)]);
        assert_eq!(ranges.buffered_ahead(2.0), 4.0);
        assert_eq!(ranges.buffered_ahead(8.0), 0.0);
        assert_eq!(ranges.buffered_ahead(15.0), 5.0);
        assert_eq!(TimeRanges::new().buffered_ahead(0.0), 0.0);
    }

    #[test]
    fn test_metadata_parse() {
        let text = r#"[
            {"version": 1},
            [
                {"path": "seg/0.m4s", "duration": 2.0, "size": 1024},
                {"path": "seg/1.m4s", "duration": 2.5}
            ]
        ]"#;
        let metadata = Metadata::parse(text).unwrap();
        assert_eq!(metadata.segments.len(), 2);
        assert_eq!(metadata.segments.duration(), 4.5);

        let base = Url::parse("https://cdn.example.com/movie/file.json").unwrap();
        let resolved = metadata.segments.resolve(&base).unwrap();
        assert_eq!(resolved[1].url.as_str(), "https://cdn.example.com/movie/seg/1.m4s");
        assert_eq!(resolved[1].start, 2.0);
        assert_eq!(resolved[1].end(), 4.5);
    }

    #[test]
    fn test_metadata_missing_index() {
        let err = Metadata::parse(r#"[{"version": 1}]"#).unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata(_)));

        let err = Metadata::parse("not json").unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata(_)));
    }

    #[test]
    fn test_stage_transitions() {
        use PipelineStage::*;
        assert!(Init.can_transition_to(MetadataFetching));
        assert!(HeaderFetching.can_transition_to(EngineSpawning));
        assert!(SinkCreating.can_transition_to(Failed));
        assert!(!MetadataFetching.can_transition_to(EngineSpawning));
        assert!(!Running.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Init));
        assert!(Running.is_terminal());
    }
}
