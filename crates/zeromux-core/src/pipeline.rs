//! Pipeline Controller - bootstraps a stream and hands it to the feed loop
//!
//! Stages run strictly in order:
//! metadata → sink → header (retried) → remux worker → feeding.
//! Any stage failure short-circuits the rest and is delivered exactly once
//! through the completion callback. Cancelling before publication aborts
//! silently.
//!
//! The session is published as soon as the byte stream starts preloading;
//! the first segment is appended by the feed loop afterwards, so a failure
//! of that first append arrives as a later `Feed` error.

use crate::{
    config::StreamerConfig,
    feed::{spawn_feed_loop, Feeder},
    remux::{RemuxEngine, RemuxWorker},
    retry::{retry_fixed, RetryError},
    session::StreamerSession,
    sink::{PlaybackSink, SinkAttachment},
    stream::{ByteStream, StreamOptions},
    transport::{cache_bust, Transport},
    Error, Metadata, PipelineStage, Result, SessionId, StreamArgs,
};
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// What the completion callback receives
pub type StreamOutcome = Result<StreamerSession>;

/// Completion callback supplied by the caller
pub type StreamCallback = Box<dyn FnMut(StreamOutcome) + Send>;

/// Shared delivery point for the caller's callback
#[derive(Clone)]
pub struct Completion {
    callback: Arc<Mutex<StreamCallback>>,
}

impl Completion {
    /// Wrap `callback`; `None` delivers into a no-op
    pub fn new(callback: Option<StreamCallback>) -> Self {
        let callback = callback.unwrap_or_else(|| Box::new(|_| {}));
        Self {
            callback: Arc::new(Mutex::new(callback)),
        }
    }

    pub fn deliver(&self, outcome: StreamOutcome) {
        let mut callback = self.callback.lock().unwrap_or_else(|p| p.into_inner());
        (*callback)(outcome);
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// External collaborators and settings shared by pipelines
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub engine: Arc<dyn RemuxEngine>,
    pub config: StreamerConfig,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn Transport>, engine: Arc<dyn RemuxEngine>) -> Self {
        Self {
            transport,
            engine,
            config: StreamerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Session fields gathered across stages; only turned into a
/// [`StreamerSession`] once complete
struct SessionParts {
    attachment: Option<SinkAttachment>,
    stream: Option<Arc<ByteStream>>,
    worker: Option<RemuxWorker>,
}

impl SessionParts {
    fn new() -> Self {
        Self {
            attachment: None,
            stream: None,
            worker: None,
        }
    }

    fn take(self) -> Result<(SinkAttachment, Arc<ByteStream>, RemuxWorker)> {
        match (self.attachment, self.stream, self.worker) {
            (Some(attachment), Some(stream), Some(worker)) => Ok((attachment, stream, worker)),
            _ => Err(Error::Internal("session published before all stages completed".into())),
        }
    }
}

/// One bootstrap run
pub struct Pipeline {
    id: SessionId,
    args: StreamArgs,
    sink: Arc<dyn PlaybackSink>,
    collaborators: Collaborators,
    cancel: CancellationToken,
    stage: watch::Sender<PipelineStage>,
}

impl Pipeline {
    pub fn new(args: StreamArgs, sink: Arc<dyn PlaybackSink>, collaborators: Collaborators) -> Self {
        let (stage, _) = watch::channel(PipelineStage::Init);
        Self {
            id: SessionId::new(),
            args,
            sink,
            collaborators,
            cancel: CancellationToken::new(),
            stage,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Token aborting the run (and, once published, the session's feeding)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to stage changes
    pub fn subscribe_stage(&self) -> watch::Receiver<PipelineStage> {
        self.stage.subscribe()
    }

    fn set_stage(&self, next: PipelineStage) {
        let current = *self.stage.borrow();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected stage transition");
        }
        self.stage.send_replace(next);
        info!(session_id = %self.id, from = %current, to = %next, "Stage transition");
    }

    /// Drive every stage and deliver the outcome through `completion`
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run(self, completion: Completion) {
        match self.bootstrap(&completion).await {
            Ok((session, feeder)) => {
                completion.deliver(Ok(session.clone()));
                self.set_stage(PipelineStage::Running);
                let token = session.feed_token();
                session.attach_feed_task(spawn_feed_loop(feeder, token));
            }
            Err(Error::Cancelled) => {
                self.set_stage(PipelineStage::Cancelled);
                info!("Pipeline cancelled before the session was published");
            }
            Err(e) => {
                error!(
                    code = e.error_code(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Pipeline failed"
                );
                self.set_stage(PipelineStage::Failed);
                completion.deliver(Err(e));
            }
        }
    }

    async fn bootstrap(&self, completion: &Completion) -> Result<(StreamerSession, Arc<Feeder>)> {
        let mut parts = SessionParts::new();

        self.set_stage(PipelineStage::MetadataFetching);
        let metadata = self.guard(self.fetch_metadata()).await?;

        self.set_stage(PipelineStage::SinkCreating);
        self.guard(self.create_sink(&metadata, &mut parts)).await?;

        self.set_stage(PipelineStage::HeaderFetching);
        let header = self.fetch_header().await?;

        self.set_stage(PipelineStage::EngineSpawning);
        parts.worker = Some(self.guard(self.spawn_engine(header)).await?);

        self.set_stage(PipelineStage::Feeding);
        self.start_feeding(parts, completion).await
    }

    async fn guard<T>(&self, stage: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = stage => result,
        }
    }

    #[instrument(skip(self), fields(url = %self.args.metadata_url))]
    async fn fetch_metadata(&self) -> Result<Metadata> {
        let url = cache_bust(&self.args.metadata_url);
        let text = self
            .collaborators
            .transport
            .fetch_text(&url, "application/json")
            .await
            .map_err(|e| {
                warn!(error = %e, "Metadata download failed");
                Error::MetadataFetch {
                    reason: e.to_string(),
                }
            })?;

        let metadata = Metadata::parse(&text)?;
        info!(segments = metadata.segments.len(), duration = metadata.segments.duration(), "Metadata decoded");
        Ok(metadata)
    }

    #[instrument(skip(self, metadata, parts), fields(codec = %self.args.codec))]
    async fn create_sink(&self, metadata: &Metadata, parts: &mut SessionParts) -> Result<()> {
        let attachment = self
            .sink
            .create_buffer(&self.args.codec)
            .await
            .ok_or_else(|| Error::SinkCreation {
                codec: self.args.codec.to_string(),
            })?;
        info!(url = %attachment.playback_url, source = %attachment.source, "Playback buffer created");

        let config = &self.collaborators.config;
        let mut events = self.args.events.clone().unwrap_or_default();
        events.delay = config.pacing_delay();

        let stream = ByteStream::new(
            self.collaborators.transport.clone(),
            &self.args.metadata_url,
            &metadata.segments,
            events,
            StreamOptions {
                prefetch_depth: config.prefetch_depth,
                retry: config.segment_retry(),
            },
        )
        .map_err(|e| Error::InvalidMetadata(e.to_string()))?;

        parts.attachment = Some(attachment);
        parts.stream = Some(Arc::new(stream));
        Ok(())
    }

    #[instrument(skip(self), fields(url = %self.args.header_url))]
    async fn fetch_header(&self) -> Result<Bytes> {
        let policy = self.collaborators.config.header_retry();
        let transport = &self.collaborators.transport;
        let header_url = &self.args.header_url;

        let result = retry_fixed(policy, &self.cancel, "moov", |attempt| {
            info!(attempt, "Downloading moov box");
            let url = cache_bust(header_url);
            async move { transport.fetch_binary(&url).await }
        })
        .await;

        match result {
            Ok(header) => {
                info!(bytes = header.len(), "Moov box downloaded");
                Ok(header)
            }
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(Error::HeaderFetch {
                attempts,
                reason: last.to_string(),
            }),
        }
    }

    #[instrument(skip_all, fields(bytes = header.len()))]
    async fn spawn_engine(&self, header: Bytes) -> Result<RemuxWorker> {
        self.collaborators
            .engine
            .spawn(header)
            .await
            .map_err(|e| {
                warn!(error = %e, "Remux worker could not start");
                Error::EngineSpawn {
                    reason: e.to_string(),
                }
            })
    }

    async fn start_feeding(
        &self,
        parts: SessionParts,
        completion: &Completion,
    ) -> Result<(StreamerSession, Arc<Feeder>)> {
        let (attachment, stream, worker) = parts.take()?;
        let SinkAttachment {
            source,
            buffer,
            playback_url,
        } = attachment;

        let feeder = Arc::new(Feeder::new(
            self.id,
            self.sink.clone(),
            stream.clone(),
            buffer,
            worker,
            self.collaborators.config.feed.clone(),
            completion.clone(),
        ));

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        stream.preload().await;

        let session = StreamerSession::new(
            self.id,
            source,
            playback_url,
            self.sink.clone(),
            stream,
            feeder.clone(),
            self.cancel.child_token(),
        );
        Ok((session, feeder))
    }
}

/// Handle onto a spawned pipeline
#[derive(Debug)]
pub struct PipelineHandle {
    id: SessionId,
    cancel: CancellationToken,
    stage: watch::Receiver<PipelineStage>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current controller stage
    pub fn stage(&self) -> PipelineStage {
        *self.stage.borrow()
    }

    /// Abort the pipeline. Before publication no callback is invoked;
    /// afterwards the session stops feeding.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the controller reaches a terminal stage
    pub async fn wait_terminal(&mut self) -> PipelineStage {
        let waited = self
            .stage
            .wait_for(PipelineStage::is_terminal)
            .await
            .map(|stage| *stage);
        match waited {
            Ok(stage) => stage,
            Err(_) => *self.stage.borrow(),
        }
    }

    /// Wait for the controller task to finish
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("pipeline task failed: {e}")))
    }
}

/// Start streaming `args` into `sink`.
///
/// `callback` receives the published session or the stage error exactly
/// once, and later a feed failure at most once.
pub fn start_stream(
    args: StreamArgs,
    sink: Arc<dyn PlaybackSink>,
    collaborators: Collaborators,
    callback: Option<StreamCallback>,
) -> PipelineHandle {
    let pipeline = Pipeline::new(args, sink, collaborators);
    let id = pipeline.id();
    let cancel = pipeline.cancel_token();
    let stage = pipeline.subscribe_stage();
    let task = tokio::spawn(pipeline.run(Completion::new(callback)));

    PipelineHandle {
        id,
        cancel,
        stage,
        task,
    }
}

/// Start streaming and wait for the session.
///
/// Later feed failures are logged and visible through
/// [`StreamerSession::failure`].
pub async fn open_stream(
    args: StreamArgs,
    sink: Arc<dyn PlaybackSink>,
    collaborators: Collaborators,
) -> Result<StreamerSession> {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let callback: StreamCallback = Box::new(move |outcome| match tx.take() {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => {
            if let Err(e) = outcome {
                warn!(error = %e, "Stream failed after start");
            }
        }
    });

    let _handle = start_stream(args, sink, collaborators, Some(callback));
    rx.await.map_err(|_| Error::Cancelled)?
}
