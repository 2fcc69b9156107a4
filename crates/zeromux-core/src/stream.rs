//! Byte stream source
//!
//! Turns the segment index into a lazy, pausable sequence of raw segments.
//! A background task fetches ahead into a bounded channel; the feed loop
//! pulls from the other end.

use crate::{
    events::{EventPolicy, StreamEvent, TriggerPoint},
    retry::{retry_fixed, RetryError, RetryPolicy},
    transport::{cache_bust, Transport},
    Error, RawSegment, Result, SegmentDescriptor, SegmentIndex,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Fetch-ahead settings of a byte stream
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Segments buffered between fetcher and consumer
    pub prefetch_depth: usize,
    /// Retry policy per segment download
    pub retry: RetryPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            prefetch_depth: 3,
            retry: RetryPolicy::none(),
        }
    }
}

struct Prefetch {
    rx: mpsc::Receiver<Result<RawSegment>>,
    token: CancellationToken,
}

/// Lazy, pausable sequence of raw segments
pub struct ByteStream {
    transport: Arc<dyn Transport>,
    segments: Arc<[SegmentDescriptor]>,
    events: EventPolicy,
    options: StreamOptions,
    prefetch: Mutex<Option<Prefetch>>,
    paused: watch::Sender<bool>,
    emitted: AtomicUsize,
    exhausted: AtomicBool,
    cancel: CancellationToken,
}

impl ByteStream {
    /// Build a stream over `index`, resolving segment paths against
    /// `metadata_url`
    pub fn new(
        transport: Arc<dyn Transport>,
        metadata_url: &Url,
        index: &SegmentIndex,
        events: EventPolicy,
        options: StreamOptions,
    ) -> Result<Self> {
        let segments = index.resolve(metadata_url)?;
        let (paused, _) = watch::channel(false);

        Ok(Self {
            transport,
            segments: segments.into(),
            events,
            options,
            prefetch: Mutex::new(None),
            paused,
            emitted: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Number of segments in the stream
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments handed to the consumer so far
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn events(&self) -> &EventPolicy {
        &self.events
    }

    /// Start fetching ahead. Calling it again while a fetch-ahead is
    /// active is a no-op.
    #[instrument(skip(self), fields(segments = self.segments.len()))]
    pub async fn preload(&self) {
        let mut prefetch = self.prefetch.lock().await;
        if prefetch.is_some() {
            return;
        }

        let start = self.emitted();
        let (tx, rx) = mpsc::channel(self.options.prefetch_depth.max(1));
        let token = self.cancel.child_token();

        let fetcher = Fetcher {
            transport: self.transport.clone(),
            segments: self.segments.clone(),
            events: self.events.clone(),
            retry: self.options.retry,
            paused: self.paused.subscribe(),
            token: token.clone(),
        };
        tokio::spawn(fetcher.run(start, tx));

        *prefetch = Some(Prefetch { rx, token });
        info!(from = start, "Byte stream preloading");
        self.events.emit(&StreamEvent::new(TriggerPoint::Preload));
    }

    /// Next raw segment, or `None` once the stream is exhausted.
    ///
    /// Fails with [`Error::StreamNotPreloaded`] before the first
    /// [`preload`](Self::preload).
    pub async fn pull(&self) -> Result<Option<RawSegment>> {
        if self.is_exhausted() {
            return Ok(None);
        }

        let mut guard = self.prefetch.lock().await;
        let prefetch = guard.as_mut().ok_or(Error::StreamNotPreloaded)?;

        match prefetch.rx.recv().await {
            Some(Ok(segment)) => {
                self.emitted.fetch_add(1, Ordering::SeqCst);
                self.events.emit(&StreamEvent::segment(
                    TriggerPoint::SegmentEmitted,
                    segment.descriptor.index,
                    segment.data.len(),
                ));
                Ok(Some(segment))
            }
            Some(Err(e)) => Err(e),
            None => {
                if self.emitted() < self.segments.len() {
                    // Fetcher stopped early: restarted or torn down.
                    return Err(Error::Internal("byte stream fetcher stopped".into()));
                }
                if !self.exhausted.swap(true, Ordering::SeqCst) {
                    debug!(segments = self.segments.len(), "Byte stream exhausted");
                    self.events.emit(&StreamEvent::new(TriggerPoint::End));
                }
                Ok(None)
            }
        }
    }

    /// Hold back further emissions
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            self.events.emit(&StreamEvent::new(TriggerPoint::Pause));
        }
    }

    /// Continue emitting after [`pause`](Self::pause)
    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            self.events.emit(&StreamEvent::new(TriggerPoint::Resume));
        }
    }

    /// Resolve once the stream is paused
    pub async fn wait_until_paused(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| *paused).await;
    }

    /// Resolve once the stream is not paused
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Drop fetched data and rewind to the first segment.
    ///
    /// A new [`preload`](Self::preload) is required before pulling again.
    pub async fn restart(&self) {
        let mut prefetch = self.prefetch.lock().await;
        if let Some(old) = prefetch.take() {
            old.token.cancel();
        }
        self.emitted.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        debug!("Byte stream restarted");
    }

    /// Stop fetching for good
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("segments", &self.segments.len())
            .field("emitted", &self.emitted())
            .field("exhausted", &self.is_exhausted())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Fetch-ahead task state
struct Fetcher {
    transport: Arc<dyn Transport>,
    segments: Arc<[SegmentDescriptor]>,
    events: EventPolicy,
    retry: RetryPolicy,
    paused: watch::Receiver<bool>,
    token: CancellationToken,
}

impl Fetcher {
    async fn run(mut self, start: usize, tx: mpsc::Sender<Result<RawSegment>>) {
        let segments = self.segments.clone();
        for descriptor in segments.iter().skip(start) {
            if !self.wait_unpaused().await {
                return;
            }

            let transport = self.transport.clone();
            let fetched = retry_fixed(self.retry, &self.token, "segment", |_| {
                let transport = transport.clone();
                let url = cache_bust(&descriptor.url);
                async move { transport.fetch_binary(&url).await }
            })
            .await;

            let data = match fetched {
                Ok(data) => data,
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(segment = descriptor.index, attempts, error = %last, "Segment download failed");
                    self.events
                        .emit(&StreamEvent::error(descriptor.index, last.to_string()));
                    let _ = tx
                        .send(Err(Error::SegmentFetch {
                            index: descriptor.index,
                            reason: last.to_string(),
                        }))
                        .await;
                    return;
                }
            };

            self.events.emit(&StreamEvent::segment(
                TriggerPoint::SegmentLoaded,
                descriptor.index,
                data.len(),
            ));

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(self.events.delay) => {}
            }

            let segment = RawSegment {
                descriptor: descriptor.clone(),
                data,
            };
            tokio::select! {
                _ = self.token.cancelled() => return,
                sent = tx.send(Ok(segment)) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Block while paused; false if cancelled meanwhile
    async fn wait_unpaused(&mut self) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            res = self.paused.wait_for(|paused| !*paused) => res.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentEntry;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        failures: StdMutex<HashMap<String, usize>>,
        requests: StdMutex<Vec<Url>>,
    }

    impl FakeTransport {
        fn failing(path: &str, times: usize) -> Self {
            let t = Self::default();
            t.failures.lock().unwrap().insert(path.to_string(), times);
            t
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch_text(&self, url: &Url, _mime: &str) -> Result<String> {
            Err(Error::transport(url, "unused"))
        }

        async fn fetch_binary(&self, url: &Url) -> Result<Bytes> {
            self.requests.lock().unwrap().push(url.clone());
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(url.path()) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::transport(url, "503"));
                }
            }
            Ok(Bytes::from(url.path().as_bytes().to_vec()))
        }
    }

    fn index(n: usize) -> SegmentIndex {
        SegmentIndex(
            (0..n)
                .map(|i| SegmentEntry {
                    path: format!("seg/{i}.m4s"),
                    duration: 2.0,
                    size: None,
                })
                .collect(),
        )
    }

    fn stream(transport: Arc<FakeTransport>, n: usize, events: EventPolicy, retry: RetryPolicy) -> ByteStream {
        let base = Url::parse("https://cdn.example.com/movie/file.json").unwrap();
        ByteStream::new(
            transport,
            &base,
            &index(n),
            events,
            StreamOptions {
                prefetch_depth: 2,
                retry,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_before_preload() {
        let s = stream(Arc::new(FakeTransport::default()), 2, EventPolicy::new(), RetryPolicy::none());
        assert!(matches!(s.pull().await, Err(Error::StreamNotPreloaded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_in_order_then_exhausts() {
        let transport = Arc::new(FakeTransport::default());
        let emitted = Arc::new(StdMutex::new(Vec::new()));
        let ends = Arc::new(AtomicUsize::new(0));
        let (e, n) = (emitted.clone(), ends.clone());
        let events = EventPolicy::new()
            .on(TriggerPoint::SegmentEmitted, move |ev| e.lock().unwrap().push(ev.segment))
            .on(TriggerPoint::End, move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            });

        let s = stream(transport.clone(), 3, events, RetryPolicy::none());
        s.preload().await;
        s.preload().await;

        for i in 0..3 {
            let seg = s.pull().await.unwrap().unwrap();
            assert_eq!(seg.descriptor.index, i);
            assert_eq!(seg.data, Bytes::from(format!("/movie/seg/{i}.m4s")));
        }
        assert!(s.pull().await.unwrap().is_none());
        assert!(s.pull().await.unwrap().is_none());
        assert!(s.is_exhausted());

        assert_eq!(*emitted.lock().unwrap(), vec![Some(0), Some(1), Some(2)]);
        assert_eq!(ends.load(Ordering::SeqCst), 1);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|u| u.query().unwrap_or("").contains("nocache=")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_delay() {
        let s = stream(
            Arc::new(FakeTransport::default()),
            2,
            EventPolicy::new().with_delay(Duration::from_millis(17)),
            RetryPolicy::none(),
        );
        let started = tokio::time::Instant::now();
        s.preload().await;
        s.pull().await.unwrap();
        s.pull().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(34));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segment_retry_then_failure() {
        let transport = Arc::new(FakeTransport::failing("/movie/seg/1.m4s", 10));
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let events = EventPolicy::new().on(TriggerPoint::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let s = stream(transport.clone(), 3, events, RetryPolicy::fixed(2, Duration::from_millis(100)));
        s.preload().await;

        assert!(s.pull().await.unwrap().is_some());
        let err = s.pull().await.unwrap_err();
        assert!(matches!(err, Error::SegmentFetch { index: 1, .. }));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let attempts = transport
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.path() == "/movie/seg/1.m4s")
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume() {
        let s = Arc::new(stream(Arc::new(FakeTransport::default()), 2, EventPolicy::new(), RetryPolicy::none()));
        s.pause();
        assert!(s.is_paused());
        s.preload().await;

        let puller = {
            let s = s.clone();
            tokio::spawn(async move { s.pull().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!puller.is_finished());

        s.resume();
        let seg = puller.await.unwrap().unwrap().unwrap();
        assert_eq!(seg.descriptor.index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rewinds() {
        let s = stream(Arc::new(FakeTransport::default()), 2, EventPolicy::new(), RetryPolicy::none());
        s.preload().await;
        s.pull().await.unwrap();
        s.pull().await.unwrap();
        assert!(s.pull().await.unwrap().is_none());

        s.restart().await;
        assert!(!s.is_exhausted());
        assert!(matches!(s.pull().await, Err(Error::StreamNotPreloaded)));

        s.preload().await;
        let seg = s.pull().await.unwrap().unwrap();
        assert_eq!(seg.descriptor.index, 0);
    }
}
