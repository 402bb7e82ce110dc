//! Message publisher with at-least-once hand-off to the broker.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use filebridge_common::{Message, MessageId, validate_destination};

use crate::broker::Broker;
use crate::error::{BrokerError, PublishError};
use crate::observer::{NoopObserver, PipelineObserver};
use crate::retry::RetryPolicy;

/// Publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Retry budget for connecting and for each publish call.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Upper bound for a single broker round-trip, in milliseconds.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_attempt_timeout_ms() -> u64 {
    5_000
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl PublisherConfig {
    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Publisher handing messages to a [`Broker`].
///
/// A publish call returns once the broker accepted the message or the
/// retry budget is spent. Retries resend the same [`Message`], id included.
/// [`close`](Self::close) is observed between attempts: an attempt in
/// flight finishes, then the call returns [`PublishError::Closed`].
pub struct MessagePublisher {
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
    observer: Arc<dyn PipelineObserver>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for MessagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePublisher")
            .field("broker", &self.broker.name())
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessagePublisher {
    /// Create a publisher. Call [`connect`](Self::connect) before publishing.
    pub fn new(broker: Arc<dyn Broker>, config: PublisherConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            broker,
            config,
            observer: Arc::new(NoopObserver),
            closed,
        }
    }

    /// Set the observer notified of every attempt.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Get the configuration.
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Whether [`close`](Self::close) or [`cancel`](Self::cancel) was called
    /// since the last connect.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Connect to the broker, retrying transient failures.
    ///
    /// Also reopens a publisher that was closed.
    pub async fn connect(&self) -> Result<(), PublishError> {
        self.closed.send_replace(false);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.broker.connect().await {
                Ok(()) => {
                    tracing::info!(broker = self.broker.name(), attempt, "Publisher connected");
                    return Ok(());
                }
                Err(e) if e.is_transient() && self.config.retry.allows(attempt) => {
                    tracing::warn!(
                        broker = self.broker.name(),
                        attempt,
                        error = %e,
                        "Broker connect failed, retrying"
                    );
                    self.backoff(attempt).await?;
                }
                Err(e) => {
                    return Err(PublishError::ConnectFailed {
                        broker: self.broker.name().to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Publish a payload to a destination.
    pub async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
    ) -> Result<MessageId, PublishError> {
        self.send(&Message::new(destination, payload)).await
    }

    /// Publish a JSON-serialized value to a destination.
    pub async fn publish_json<T: Serialize>(
        &self,
        destination: &str,
        value: &T,
    ) -> crate::Result<MessageId> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(destination, payload).await?)
    }

    /// Publish a prepared message, retrying with the same id.
    pub async fn send(&self, message: &Message) -> Result<MessageId, PublishError> {
        let result = self.send_with_retry(message).await;
        self.observer.publish_completed(message, &result);
        result
    }

    async fn send_with_retry(&self, message: &Message) -> Result<MessageId, PublishError> {
        validate_destination(&message.destination)
            .map_err(|e| PublishError::InvalidDestination(e.to_string()))?;

        if self.is_closed() {
            return Err(PublishError::Closed);
        }

        let timeout = self.config.attempt_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(timeout, self.broker.publish(message)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BrokerError::Transient(format!(
                    "no acknowledgement within {}ms",
                    timeout.as_millis()
                ))),
            };
            self.observer.publish_attempted(message, attempt, &outcome);

            let error = match outcome {
                Ok(()) => return Ok(message.id),
                Err(BrokerError::Closed) => return Err(PublishError::Closed),
                Err(e) if !e.is_transient() => {
                    return Err(PublishError::Rejected {
                        destination: message.destination.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => e,
            };

            if self.is_closed() {
                return Err(PublishError::Closed);
            }
            if !self.config.retry.allows(attempt) {
                return Err(PublishError::Unavailable {
                    destination: message.destination.clone(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let transient = PublishError::Transient {
                destination: message.destination.clone(),
                message: error.to_string(),
            };
            tracing::debug!(id = %message.id, attempt, error = %transient, "Retrying publish");

            self.backoff(attempt).await?;

            if error.needs_reconnect() {
                if let Err(e) = self.broker.connect().await {
                    tracing::warn!(broker = self.broker.name(), error = %e, "Reconnect failed");
                }
            }
        }
    }

    /// Stop accepting publishes and release the broker connection.
    ///
    /// Publish calls waiting between attempts return [`PublishError::Closed`].
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.cancel();
        let result = self.broker.close().await;
        tracing::debug!(broker = self.broker.name(), "Publisher closed");
        result
    }

    /// Make in-flight publishes give up at their next attempt boundary
    /// without releasing the broker. [`connect`](Self::connect) undoes it.
    pub fn cancel(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(broker = self.broker.name(), "Publisher cancelled");
        }
    }

    async fn backoff(&self, attempt: u32) -> Result<(), PublishError> {
        let delay = self.config.retry.delay_for(attempt);
        let mut closed = self.closed.subscribe();

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = closed.wait_for(|closed| *closed) => Err(PublishError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> PublisherConfig {
        PublisherConfig {
            retry: RetryPolicy::with_max_attempts(max_attempts)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(5)),
            attempt_timeout_ms: 1_000,
        }
    }

    async fn setup(max_attempts: u32) -> (Arc<MemoryBroker>, MessagePublisher) {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = MessagePublisher::new(broker.clone(), fast_config(max_attempts));
        publisher.connect().await.unwrap();
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_publish_succeeds_first_try() {
        let (broker, publisher) = setup(3).await;

        let id = publisher.publish("output", b"HELLO".to_vec()).await.unwrap();

        let mut sub = broker.subscribe("output").await.unwrap();
        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, id);
        assert_eq!(received.payload, b"HELLO");
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_within_budget_publish_once() {
        let (broker, publisher) = setup(5).await;
        broker.fail_next_publishes(3);

        let id = publisher.publish("output", b"HELLO".to_vec()).await.unwrap();

        assert_eq!(broker.publish_attempts(), 4);
        assert_eq!(broker.published_count(), 1);
        assert_eq!(broker.pending("output"), 1);

        let mut sub = broker.subscribe("output").await.unwrap();
        assert_eq!(sub.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_unavailable() {
        let (broker, publisher) = setup(3).await;
        broker.set_fail_publishes(true);

        let err = publisher
            .publish("output", b"HELLO".to_vec())
            .await
            .unwrap_err();

        match err {
            PublishError::Unavailable {
                destination,
                attempts,
                ..
            } => {
                assert_eq!(destination, "output");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.published_count(), 0);
        assert_eq!(broker.pending("output"), 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect() {
        let (broker, publisher) = setup(3).await;
        broker.disconnect();

        publisher.publish("output", b"again".to_vec()).await.unwrap();

        assert!(broker.is_connected());
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_destination_is_rejected_without_attempt() {
        let (broker, publisher) = setup(3).await;

        let err = publisher.publish("queue/*", vec![]).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidDestination(_)));
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_between_attempts() {
        let broker = Arc::new(MemoryBroker::new());
        let config = PublisherConfig {
            retry: RetryPolicy::with_max_attempts(0)
                .with_backoff(Duration::from_millis(200), Duration::from_millis(200)),
            attempt_timeout_ms: 1_000,
        };
        let publisher = Arc::new(MessagePublisher::new(broker.clone(), config));
        publisher.connect().await.unwrap();
        broker.set_fail_publishes(true);

        let task = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish("output", b"x".to_vec()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("publish should observe close")
            .unwrap();
        assert_eq!(result, Err(PublishError::Closed));
        assert!(publisher.is_closed());
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_cancel_ends_publish_after_current_attempt() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_publish_latency(Duration::from_millis(200));
        let config = PublisherConfig {
            retry: RetryPolicy::with_max_attempts(0)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
            attempt_timeout_ms: 50,
        };
        let publisher = Arc::new(MessagePublisher::new(broker.clone(), config));
        publisher.connect().await.unwrap();

        let task = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish("output", b"x".to_vec()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("publish should observe cancel")
            .unwrap();
        assert_eq!(result, Err(PublishError::Closed));
        assert!(publisher.is_closed());
        assert!(broker.is_connected());

        broker.set_publish_latency(Duration::ZERO);
        publisher.connect().await.unwrap();
        assert!(publisher.publish("output", b"x".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails_until_reconnect() {
        let (_broker, publisher) = setup(3).await;
        publisher.close().await.unwrap();

        assert_eq!(
            publisher.publish("output", vec![1]).await,
            Err(PublishError::Closed)
        );

        publisher.connect().await.unwrap();
        assert!(publisher.publish("output", vec![1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_budget() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_fail_connect(true);
        let publisher = MessagePublisher::new(broker, fast_config(2));

        let err = publisher.connect().await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::ConnectFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_publish_latency(Duration::from_millis(200));
        let config = PublisherConfig {
            retry: RetryPolicy::with_max_attempts(2)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
            attempt_timeout_ms: 20,
        };
        let publisher = MessagePublisher::new(broker.clone(), config);
        publisher.connect().await.unwrap();

        let err = publisher.publish("output", vec![1]).await.unwrap_err();
        match err {
            PublishError::Unavailable { last_error, .. } => {
                assert!(last_error.contains("no acknowledgement within 20ms"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_attempt() {
        #[derive(Default)]
        struct Attempts(AtomicU32, AtomicU32);

        impl PipelineObserver for Attempts {
            fn publish_attempted(&self, _: &Message, _: u32, _: &Result<(), BrokerError>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }

            fn publish_completed(&self, _: &Message, _: &Result<MessageId, PublishError>) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let broker = Arc::new(MemoryBroker::new());
        let observer = Arc::new(Attempts::default());
        let publisher =
            MessagePublisher::new(broker.clone(), fast_config(5)).with_observer(observer.clone());
        publisher.connect().await.unwrap();
        broker.fail_next_publishes(2);

        tokio_test::assert_ok!(publisher.publish("output", vec![1]).await);

        assert_eq!(observer.0.load(Ordering::SeqCst), 3);
        assert_eq!(observer.1.load(Ordering::SeqCst), 1);
    }
}
