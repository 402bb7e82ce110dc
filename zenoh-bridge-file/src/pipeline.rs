//! File → queue → sink pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use filebridge_common::{
    FileEvent, FileIdentity, HealthSnapshot, Message, MessageId, validate_destination,
};
use filebridge_framework::{
    BridgeError, BridgeHealth, Broker, ConsumeError, MessageConsumer, MessageHandler,
    MessagePublisher, NoopObserver, Observers, PipelineObserver, PublishError, Service,
    TracingObserver,
};

use crate::config::FileBridgeConfig;
use crate::sink::{LogSink, PublishingSink, Sink, SinkHandler, SinkKind};
use crate::watcher::{DirectoryWatcher, Disposition, FileHandler, WatchError};

/// Lifecycle state of a [`BridgePipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Errors surfaced by [`BridgePipeline`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline cannot start while {0}")]
    InvalidState(PipelineState),

    #[error("Pipeline is missing {0}")]
    Incomplete(&'static str),

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

/// Pipeline behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Offer a file again on a later tick when its publish ended
    /// `Unavailable`, keeping the same message id.
    #[serde(default = "default_true")]
    pub requeue_on_unavailable: bool,

    /// How long `stop` lets an in-flight publish keep retrying before it is
    /// cancelled and its file left for the next start.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            requeue_on_unavailable: true,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl PipelineOptions {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// State shared between the pipeline and its file handler.
#[derive(Debug, Default)]
struct Shared {
    last_error: Mutex<Option<String>>,
    /// Ids reserved for files waiting to be published again.
    pending: Mutex<HashMap<FileIdentity, MessageId>>,
    dropped_files: AtomicU64,
}

impl Shared {
    fn record_error(&self, error: impl std::fmt::Display) {
        *self.last_error.lock() = Some(error.to_string());
    }
}

/// Publishes each stable file to the queue.
struct PublishFile {
    publisher: Arc<MessagePublisher>,
    destination: String,
    observer: Arc<dyn PipelineObserver>,
    shared: Arc<Shared>,
    requeue: bool,
}

#[async_trait]
impl FileHandler for PublishFile {
    async fn on_file(&self, event: FileEvent) -> Disposition {
        let identity = event.identity();
        let reserved = {
            let mut pending = self.shared.pending.lock();
            // A rewritten file gets a new identity; the old reservation is stale.
            pending.retain(|known, _| known.path != identity.path || *known == identity);
            pending.get(&identity).copied()
        };

        let mut message = Message::new(&self.destination, event.bytes.clone()).with_origin(&event.path);
        match reserved {
            Some(id) => message = message.with_id(id),
            None => self.observer.file_detected(&event),
        }

        match self.publisher.send(&message).await {
            Ok(_) => {
                self.shared.pending.lock().remove(&identity);
                Disposition::Processed
            }
            Err(e @ PublishError::Unavailable { .. }) if self.requeue => {
                tracing::warn!(
                    path = %identity.path.display(),
                    id = %message.id,
                    error = %e,
                    "Publish failed, file will be offered again"
                );
                self.shared.pending.lock().insert(identity, message.id);
                self.shared.record_error(&e);
                Disposition::Retry
            }
            Err(PublishError::Closed) => {
                self.shared.pending.lock().insert(identity, message.id);
                Disposition::Retry
            }
            Err(e) => {
                tracing::error!(
                    path = %identity.path.display(),
                    id = %message.id,
                    error = %e,
                    "Publish failed, dropping file"
                );
                self.shared.pending.lock().remove(&identity);
                self.shared.dropped_files.fetch_add(1, Ordering::SeqCst);
                self.shared.record_error(&e);
                Disposition::Processed
            }
        }
    }
}

/// One file-source → queue path and one queue → sink path.
///
/// The owner calls [`start`](Self::start) and [`stop`](Self::stop).
/// Dropping a pipeline that is not stopped signals every component to stop
/// and aborts their tasks.
pub struct BridgePipeline {
    watcher: DirectoryWatcher,
    publisher: Arc<MessagePublisher>,
    consumer: MessageConsumer,
    destination: String,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn PipelineObserver>,
    health: Option<Arc<BridgeHealth>>,
    options: PipelineOptions,
    shared: Arc<Shared>,
    state: watch::Sender<PipelineState>,
}

impl std::fmt::Debug for BridgePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgePipeline")
            .field("destination", &self.destination)
            .field("state", &self.status())
            .field("watcher", &self.watcher)
            .field("publisher", &self.publisher)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl BridgePipeline {
    pub fn builder() -> BridgePipelineBuilder {
        BridgePipelineBuilder::default()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Receiver following every state transition.
    pub fn watch_status(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Destination the files are published to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Most recent terminal error seen by the pipeline.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Files dropped after a terminal publish failure.
    pub fn dropped_files(&self) -> u64 {
        self.shared.dropped_files.load(Ordering::SeqCst)
    }

    /// Health counters, when a [`BridgeHealth`] was attached.
    pub fn health(&self) -> Option<HealthSnapshot> {
        self.health.as_ref().map(|health| health.snapshot())
    }

    /// Connect the publisher, subscribe the consumer, start the watcher.
    ///
    /// On failure everything already started is torn down and the first
    /// error is returned.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        let state = self.status();
        if state != PipelineState::Stopped {
            return Err(PipelineError::InvalidState(state));
        }

        self.set_state(PipelineState::Starting);

        if let Err(e) = self.start_components().await {
            tracing::error!(destination = %self.destination, error = %e, "Pipeline failed to start");
            self.shared.record_error(&e);
            if let Some(health) = &self.health {
                health.record_error(e.to_string());
            }
            if let Err(teardown) = self.teardown().await {
                tracing::warn!(error = %teardown, "Teardown after failed start reported an error");
            }
            self.set_state(PipelineState::Stopped);
            return Err(e);
        }

        self.set_state(PipelineState::Running);
        tracing::info!(
            destination = %self.destination,
            dir = %self.watcher.config().dir.display(),
            "Pipeline running"
        );
        Ok(())
    }

    async fn start_components(&mut self) -> Result<(), PipelineError> {
        self.publisher.connect().await?;

        self.consumer
            .subscribe(&self.destination, self.handler.clone())
            .await?;

        self.watcher.on_file(Arc::new(PublishFile {
            publisher: self.publisher.clone(),
            destination: self.destination.clone(),
            observer: self.observer.clone(),
            shared: self.shared.clone(),
            requeue: self.options.requeue_on_unavailable,
        }));
        self.watcher.start().await?;

        Ok(())
    }

    /// Stop the watcher, then the consumer, then close the publisher.
    ///
    /// Teardown always completes; the first error is returned. Calling it
    /// on a stopped pipeline does nothing.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        if self.status() == PipelineState::Stopped {
            return Ok(());
        }

        self.set_state(PipelineState::Stopping);
        let result = self.teardown().await;
        self.set_state(PipelineState::Stopped);

        match &result {
            Ok(()) => tracing::info!(destination = %self.destination, "Pipeline stopped"),
            Err(e) => {
                tracing::warn!(destination = %self.destination, error = %e, "Pipeline stopped with error");
                self.shared.record_error(e);
            }
        }
        result
    }

    async fn teardown(&mut self) -> Result<(), PipelineError> {
        let mut first: Option<PipelineError> = None;

        // A publish still retrying after the drain timeout is cancelled; its
        // file keeps its id and is offered again on the next start.
        let drain = self.options.drain_timeout();
        let stopping = self.watcher.stop();
        tokio::pin!(stopping);
        let stopped = match tokio::time::timeout(drain, &mut stopping).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(
                    destination = %self.destination,
                    drain_ms = self.options.drain_timeout_ms,
                    "Publish still in flight, cancelling retries"
                );
                self.publisher.cancel();
                stopping.await
            }
        };
        if let Err(e) = stopped {
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.consumer.unsubscribe().await {
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.publisher.close().await {
            tracing::warn!(error = %e, "Error closing broker");
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        tracing::debug!(from = %previous, to = %state, "Pipeline state changed");
    }
}

impl Drop for BridgePipeline {
    fn drop(&mut self) {
        if self.status() != PipelineState::Stopped {
            tracing::warn!(
                destination = %self.destination,
                "Pipeline dropped without stop, aborting its tasks"
            );
        }
    }
}

#[async_trait]
impl Service for BridgePipeline {
    async fn start(&mut self) -> filebridge_framework::Result<()> {
        BridgePipeline::start(self)
            .await
            .map_err(|e| BridgeError::with_context("pipeline start", e))
    }

    async fn stop(&mut self) -> filebridge_framework::Result<()> {
        BridgePipeline::stop(self)
            .await
            .map_err(|e| BridgeError::with_context("pipeline stop", e))
    }

    fn metadata(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "watch_dir": self.watcher.config().dir.display().to_string(),
            "destination": self.destination,
            "state": self.status(),
        }))
    }

    fn health(&self) -> Option<HealthSnapshot> {
        BridgePipeline::health(self)
    }
}

/// Builder for [`BridgePipeline`].
#[derive(Default)]
pub struct BridgePipelineBuilder {
    watcher: Option<DirectoryWatcher>,
    publisher: Option<Arc<MessagePublisher>>,
    consumer: Option<MessageConsumer>,
    destination: Option<String>,
    handler: Option<Arc<dyn MessageHandler>>,
    observer: Option<Arc<dyn PipelineObserver>>,
    health: Option<Arc<BridgeHealth>>,
    options: PipelineOptions,
}

impl BridgePipelineBuilder {
    pub fn watcher(mut self, watcher: DirectoryWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn publisher(mut self, publisher: Arc<MessagePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn consumer(mut self, consumer: MessageConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Observer notified of detected files. Defaults to none.
    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Health counters reported by [`BridgePipeline::health`].
    pub fn health(mut self, health: Arc<BridgeHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<BridgePipeline, PipelineError> {
        let destination = self.destination.ok_or(PipelineError::Incomplete("destination"))?;
        validate_destination(&destination)
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let (state, _) = watch::channel(PipelineState::Stopped);

        Ok(BridgePipeline {
            watcher: self.watcher.ok_or(PipelineError::Incomplete("watcher"))?,
            publisher: self.publisher.ok_or(PipelineError::Incomplete("publisher"))?,
            consumer: self.consumer.ok_or(PipelineError::Incomplete("consumer"))?,
            handler: self.handler.ok_or(PipelineError::Incomplete("handler"))?,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            health: self.health,
            options: self.options,
            destination,
            shared: Arc::new(Shared::default()),
            state,
        })
    }
}

/// Assemble a pipeline from configuration, delivering to the configured sink.
pub fn build_pipeline(
    config: &FileBridgeConfig,
    broker: Arc<dyn Broker>,
) -> Result<BridgePipeline, PipelineError> {
    let sink: Arc<dyn Sink> = match &config.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Forward { destination } => {
            let publisher = MessagePublisher::new(broker.clone(), config.publisher.clone());
            Arc::new(PublishingSink::new(Arc::new(publisher), destination.clone()))
        }
    };
    build_pipeline_with_sink(config, broker, sink)
}

/// Assemble a pipeline from configuration with a caller-provided sink.
///
/// Logs every stage through [`TracingObserver`] and counts them in a
/// [`BridgeHealth`].
pub fn build_pipeline_with_sink(
    config: &FileBridgeConfig,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn Sink>,
) -> Result<BridgePipeline, PipelineError> {
    config
        .validate_config()
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let health = Arc::new(BridgeHealth::new("file"));
    let observer: Arc<dyn PipelineObserver> = Arc::new(
        Observers::new()
            .with(Arc::new(TracingObserver))
            .with(health.clone()),
    );

    let publisher = MessagePublisher::new(broker.clone(), config.publisher.clone())
        .with_observer(observer.clone());
    let consumer =
        MessageConsumer::new(broker, config.consumer.clone()).with_observer(observer.clone());
    let handler = SinkHandler::new(config.transform.build(), sink);

    BridgePipeline::builder()
        .watcher(DirectoryWatcher::new(config.file.clone()))
        .publisher(Arc::new(publisher))
        .consumer(consumer)
        .destination(config.queue.destination.clone())
        .handler(Arc::new(handler))
        .observer(observer)
        .health(health)
        .options(config.pipeline.clone())
        .build()
}
