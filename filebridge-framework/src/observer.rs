//! Stage hooks invoked around each step of a pipeline.
//!
//! Observers see files as they are detected, every publish attempt, and
//! every delivered message. They must not block: they run inline on the
//! watcher, publisher and consumer tasks.

use std::sync::Arc;

use filebridge_common::{DeliveredMessage, FileEvent, Message, MessageId};

use crate::error::{BrokerError, PublishError};

/// Longest payload excerpt written to logs.
const PREVIEW_LEN: usize = 64;

/// Hooks called by the watcher, publisher and consumer.
///
/// Every method has an empty default so implementations only override the
/// stages they care about.
pub trait PipelineObserver: Send + Sync {
    /// A stable file was read from the watched directory.
    fn file_detected(&self, _event: &FileEvent) {}

    /// One attempt to hand a message to the broker finished.
    fn publish_attempted(
        &self,
        _message: &Message,
        _attempt: u32,
        _outcome: &Result<(), BrokerError>,
    ) {
    }

    /// A publish call ended, successfully or not.
    fn publish_completed(&self, _message: &Message, _result: &Result<MessageId, PublishError>) {}

    /// A message is about to be handed to the consumer handler.
    fn message_delivered(&self, _message: &DeliveredMessage) {}

    /// The consumer handler returned an error or panicked.
    fn handler_failed(&self, _message: &DeliveredMessage, _error: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Observer writing one log line per stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn file_detected(&self, event: &FileEvent) {
        tracing::info!(
            path = %event.path.display(),
            bytes = event.bytes.len(),
            "File detected"
        );
    }

    fn publish_attempted(&self, message: &Message, attempt: u32, outcome: &Result<(), BrokerError>) {
        match outcome {
            Ok(()) => tracing::debug!(
                id = %message.id,
                destination = %message.destination,
                attempt,
                "Sending message [{}] to queue",
                preview(&message.payload)
            ),
            Err(e) => tracing::warn!(
                id = %message.id,
                destination = %message.destination,
                attempt,
                error = %e,
                "Publish attempt failed"
            ),
        }
    }

    fn publish_completed(&self, message: &Message, result: &Result<MessageId, PublishError>) {
        match result {
            Ok(id) => tracing::info!(id = %id, destination = %message.destination, "Message published"),
            Err(e) => tracing::error!(
                id = %message.id,
                destination = %message.destination,
                error = %e,
                "Message not published"
            ),
        }
    }

    fn message_delivered(&self, message: &DeliveredMessage) {
        tracing::info!(
            id = %message.id,
            destination = %message.destination,
            "Message [{}] received from queue",
            preview(&message.payload)
        );
    }

    fn handler_failed(&self, message: &DeliveredMessage, error: &str) {
        tracing::error!(id = %message.id, error = %error, "Handler failed");
    }
}

/// Fan-out to several observers, in registration order.
#[derive(Default, Clone)]
pub struct Observers {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl Observers {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    pub fn with(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.observers.len())
            .finish()
    }
}

impl PipelineObserver for Observers {
    fn file_detected(&self, event: &FileEvent) {
        for observer in &self.observers {
            observer.file_detected(event);
        }
    }

    fn publish_attempted(&self, message: &Message, attempt: u32, outcome: &Result<(), BrokerError>) {
        for observer in &self.observers {
            observer.publish_attempted(message, attempt, outcome);
        }
    }

    fn publish_completed(&self, message: &Message, result: &Result<MessageId, PublishError>) {
        for observer in &self.observers {
            observer.publish_completed(message, result);
        }
    }

    fn message_delivered(&self, message: &DeliveredMessage) {
        for observer in &self.observers {
            observer.message_delivered(message);
        }
    }

    fn handler_failed(&self, message: &DeliveredMessage, error: &str) {
        for observer in &self.observers {
            observer.handler_failed(message, error);
        }
    }
}

/// Printable excerpt of a payload.
pub fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= PREVIEW_LEN {
        text.into_owned()
    } else {
        let head: String = text.chars().take(PREVIEW_LEN).collect();
        format!("{}...", head)
    }
}
