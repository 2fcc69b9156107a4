//! Remux engine wiring
//!
//! The remuxer is owned by its own task and shares no memory with the
//! controller; each remux call runs on the blocking pool. Raw segments go in on one channel and results come back on
//! another; a failure is a terminal message, never a panic across the
//! boundary.

use crate::{Error, MediaChunk, RawSegment, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Request sent to a remux worker
#[derive(Debug)]
pub enum RemuxRequest {
    /// Remux one raw segment
    Segment(RawSegment),
    /// No more input; flush and stop
    Finish,
}

/// Message produced by a remux worker
#[derive(Debug)]
pub enum RemuxMessage {
    /// Chunks ready for the playback buffer, in order
    Output(Vec<MediaChunk>),
    /// The worker failed and stopped
    Failed(String),
}

/// Synchronous remux algorithm driven by a worker
pub trait Remuxer: Send + 'static {
    /// Repackage one raw segment
    fn remux(&mut self, segment: RawSegment) -> Result<Vec<MediaChunk>>;

    /// Flush anything held back once input ends
    fn finish(&mut self) -> Result<Vec<MediaChunk>> {
        Ok(Vec::new())
    }
}

/// Factory for remux workers
#[async_trait]
pub trait RemuxEngine: Send + Sync {
    /// Start a worker for the stream described by `header`
    async fn spawn(&self, header: Bytes) -> Result<RemuxWorker>;
}

/// Channel capacity between controller and worker
const CHANNEL_DEPTH: usize = 4;

/// Handle onto a running remux worker
#[derive(Debug)]
pub struct RemuxWorker {
    requests: mpsc::Sender<RemuxRequest>,
    messages: mpsc::Receiver<RemuxMessage>,
    failed: Option<String>,
    finished: bool,
}

impl RemuxWorker {
    /// Wrap the controller ends of the worker channels
    fn from_channels(
        requests: mpsc::Sender<RemuxRequest>,
        messages: mpsc::Receiver<RemuxMessage>,
    ) -> Self {
        Self {
            requests,
            messages,
            failed: None,
            finished: false,
        }
    }

    /// Run `remuxer` on a dedicated worker task
    pub fn spawn<R: Remuxer>(remuxer: R) -> Self {
        let (requests, request_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (message_tx, messages) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(run_worker(remuxer, request_rx, message_tx));
        Self::from_channels(requests, messages)
    }

    /// Submit a segment without waiting for its output
    pub async fn submit(&mut self, segment: RawSegment) -> Result<()> {
        self.ensure_live()?;
        self.requests
            .send(RemuxRequest::Segment(segment))
            .await
            .map_err(|_| Error::WorkerClosed)
    }

    /// Submit a segment and wait for its output
    pub async fn remux(&mut self, segment: RawSegment) -> Result<Vec<MediaChunk>> {
        self.submit(segment).await?;
        self.await_output().await
    }

    /// Signal end of input and collect the flushed output.
    ///
    /// Calling this more than once returns an empty flush.
    pub async fn finish(&mut self) -> Result<Vec<MediaChunk>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.ensure_live()?;
        self.finished = true;
        self.requests
            .send(RemuxRequest::Finish)
            .await
            .map_err(|_| Error::WorkerClosed)?;
        self.await_output().await
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    fn ensure_live(&self) -> Result<()> {
        if let Some(reason) = &self.failed {
            return Err(Error::Remux(reason.clone()));
        }
        if self.finished {
            return Err(Error::WorkerClosed);
        }
        Ok(())
    }

    async fn await_output(&mut self) -> Result<Vec<MediaChunk>> {
        match self.messages.recv().await {
            Some(RemuxMessage::Output(chunks)) => Ok(chunks),
            Some(RemuxMessage::Failed(reason)) => {
                self.failed = Some(reason.clone());
                Err(Error::Remux(reason))
            }
            None => Err(Error::WorkerClosed),
        }
    }
}

async fn run_worker<R: Remuxer>(
    mut remuxer: R,
    mut requests: mpsc::Receiver<RemuxRequest>,
    messages: mpsc::Sender<RemuxMessage>,
) {
    while let Some(request) = requests.recv().await {
        let last = matches!(request, RemuxRequest::Finish);
        let joined = tokio::task::spawn_blocking(move || {
            let result = match request {
                RemuxRequest::Segment(segment) => remuxer.remux(segment),
                RemuxRequest::Finish => remuxer.finish(),
            };
            (remuxer, result)
        })
        .await;

        let result = match joined {
            Ok((returned, result)) => {
                remuxer = returned;
                result
            }
            Err(e) => {
                warn!(error = %e, "Remux task panicked");
                let _ = messages
                    .send(RemuxMessage::Failed(format!("remux task aborted: {e}")))
                    .await;
                break;
            }
        };

        let (message, stop) = match result {
            Ok(chunks) => (RemuxMessage::Output(chunks), last),
            Err(e) => {
                warn!(error = %e, "Remux worker failed");
                let reason = match e {
                    Error::Remux(reason) => reason,
                    other => other.to_string(),
                };
                (RemuxMessage::Failed(reason), true)
            }
        };

        if messages.send(message).await.is_err() || stop {
            break;
        }
    }
    debug!("Remux worker stopped");
}

/// Builds workers from a remuxer factory.
///
/// The factory runs on the blocking pool; its error is reported as a
/// spawn failure.
pub struct WorkerEngine<F> {
    factory: F,
}

impl<F, R> WorkerEngine<F>
where
    F: Fn(Bytes) -> Result<R> + Clone + Send + Sync + 'static,
    R: Remuxer,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F, R> RemuxEngine for WorkerEngine<F>
where
    F: Fn(Bytes) -> Result<R> + Clone + Send + Sync + 'static,
    R: Remuxer,
{
    async fn spawn(&self, header: Bytes) -> Result<RemuxWorker> {
        let factory = self.factory.clone();
        let remuxer = tokio::task::spawn_blocking(move || factory(header))
            .await
            .map_err(|e| Error::Internal(format!("remux factory aborted: {e}")))??;
        Ok(RemuxWorker::spawn(remuxer))
    }
}

/// Remuxer that forwards segments unchanged, preceded by the header as the
/// initialization chunk
#[derive(Debug)]
pub struct PassthroughRemuxer {
    header: Option<Bytes>,
}

impl PassthroughRemuxer {
    /// Validate that `header` starts with a `moov` or `ftyp` box
    pub fn new(header: Bytes) -> Result<Self> {
        if header.len() < 8 {
            return Err(Error::Remux(format!("header too short: {} bytes", header.len())));
        }
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = &header[4..8];
        if kind != b"moov" && kind != b"ftyp" {
            return Err(Error::Remux(format!(
                "unexpected box type {:?}",
                String::from_utf8_lossy(kind)
            )));
        }
        if declared < 8 || declared > header.len() {
            return Err(Error::Remux(format!("bad box size {declared}")));
        }
        Ok(Self {
            header: Some(header),
        })
    }

    /// Engine spawning passthrough workers
    pub fn engine() -> WorkerEngine<fn(Bytes) -> Result<PassthroughRemuxer>> {
        WorkerEngine::new(PassthroughRemuxer::new as fn(Bytes) -> Result<PassthroughRemuxer>)
    }
}

impl Remuxer for PassthroughRemuxer {
    fn remux(&mut self, segment: RawSegment) -> Result<Vec<MediaChunk>> {
        let mut out = Vec::with_capacity(2);
        if let Some(header) = self.header.take() {
            out.push(MediaChunk::init(header));
        }
        out.push(MediaChunk::media(
            segment.data,
            segment.descriptor.start,
            segment.descriptor.end(),
        ));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentDescriptor;
    use url::Url;

    fn moov(payload: usize) -> Bytes {
        let mut data = ((8 + payload) as u32).to_be_bytes().to_vec();
        data.extend_from_slice(b"moov");
        data.extend(std::iter::repeat(0u8).take(payload));
        Bytes::from(data)
    }

    fn raw(index: usize) -> RawSegment {
        RawSegment {
            descriptor: SegmentDescriptor {
                index,
                url: Url::parse(&format!("https://cdn.example.com/seg{index}.m4s")).unwrap(),
                start: index as f64 * 2.0,
                duration: 2.0,
                size: None,
            },
            data: Bytes::from(vec![index as u8; 4]),
        }
    }

    #[test]
    fn test_passthrough_rejects_bad_header() {
        assert!(PassthroughRemuxer::new(Bytes::from_static(b"abc")).is_err());
        assert!(PassthroughRemuxer::new(Bytes::from_static(b"\0\0\0\x08mdat")).is_err());
        assert!(PassthroughRemuxer::new(Bytes::from_static(b"\0\0\0\xffmoov")).is_err());
        assert!(PassthroughRemuxer::new(moov(4)).is_ok());
    }

    #[tokio::test]
    async fn test_worker_emits_init_once() {
        let engine = PassthroughRemuxer::engine();
        let mut worker = engine.spawn(moov(16)).await.unwrap();

        let first = worker.remux(raw(0)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].is_init);
        assert_eq!(first[1].start, 0.0);

        let second = worker.remux(raw(1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].end, 4.0);

        assert!(worker.finish().await.unwrap().is_empty());
        assert!(worker.finish().await.unwrap().is_empty());
        assert!(matches!(worker.submit(raw(2)).await, Err(Error::WorkerClosed)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let engine = PassthroughRemuxer::engine();
        let err = engine.spawn(Bytes::from_static(b"garbage!")).await.unwrap_err();
        assert!(matches!(err, Error::Remux(_)));
    }

    struct FailingRemuxer;

    impl Remuxer for FailingRemuxer {
        fn remux(&mut self, segment: RawSegment) -> Result<Vec<MediaChunk>> {
            Err(Error::Remux(format!("cannot remux segment {}", segment.descriptor.index)))
        }
    }

    #[tokio::test]
    async fn test_failure_is_terminal_message() {
        let mut worker = RemuxWorker::spawn(FailingRemuxer);
        let err = worker.remux(raw(7)).await.unwrap_err();
        assert!(err.to_string().contains("segment 7"));
        assert!(worker.is_failed());
        assert!(matches!(worker.submit(raw(8)).await, Err(Error::Remux(_))));
    }
}
