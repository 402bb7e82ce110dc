//! Sinks: where consumed messages end up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use filebridge_common::DeliveredMessage;
use filebridge_framework::{MessageHandler, MessagePublisher, preview};

use crate::transform::Transform;

/// Final destination of a consumed message.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn accept(&self, message: DeliveredMessage) -> anyhow::Result<()>;
}

/// Sink writing each message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn accept(&self, message: DeliveredMessage) -> anyhow::Result<()> {
        tracing::info!(
            id = %message.id,
            origin = message.origin.as_deref().unwrap_or("-"),
            "Message [{}] delivered",
            preview(&message.payload)
        );
        Ok(())
    }
}

/// Sink publishing each message to another destination.
#[derive(Debug)]
pub struct PublishingSink {
    publisher: Arc<MessagePublisher>,
    destination: String,
}

impl PublishingSink {
    pub fn new(publisher: Arc<MessagePublisher>, destination: impl Into<String>) -> Self {
        Self {
            publisher,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

#[async_trait]
impl Sink for PublishingSink {
    async fn accept(&self, message: DeliveredMessage) -> anyhow::Result<()> {
        self.publisher
            .publish(&self.destination, message.payload)
            .await?;
        Ok(())
    }
}

/// Sink selected from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Forward { destination: String },
}

/// Unmet [`MockSink`] expectation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpectationError {
    #[error("{name}: expected {expected} messages within {timeout_ms}ms, received {received}")]
    Timeout {
        name: String,
        expected: usize,
        received: usize,
        timeout_ms: u64,
    },

    #[error("{name}: expected {expected} messages, received {received}")]
    Count {
        name: String,
        expected: usize,
        received: usize,
    },

    #[error("{name}: expected bodies {expected:?}, received {received:?}")]
    Bodies {
        name: String,
        expected: Vec<String>,
        received: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct Expectations {
    count: Option<usize>,
    bodies: Option<Vec<String>>,
}

/// In-memory sink recording every message, with expectations.
///
/// ```
/// # tokio_test::block_on(async {
/// use std::time::Duration;
/// use zenoh_bridge_file::{MockSink, Sink};
/// use filebridge_common::Message;
///
/// let sink = MockSink::new("output");
/// sink.expect_bodies(["HELLO WORLD!"]);
///
/// sink.accept(Message::new("output", b"HELLO WORLD!".to_vec()).deliver())
///     .await
///     .unwrap();
/// sink.assert_satisfied(Duration::from_secs(5)).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct MockSink {
    name: String,
    received: Mutex<Vec<DeliveredMessage>>,
    expectations: Mutex<Expectations>,
    count: watch::Sender<usize>,
}

impl MockSink {
    pub fn new(name: impl Into<String>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            expectations: Mutex::new(Expectations::default()),
            count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expect exactly `count` messages.
    pub fn expect_message_count(&self, count: usize) {
        self.expectations.lock().count = Some(count);
    }

    /// Expect exactly these bodies, in order.
    pub fn expect_bodies<I, S>(&self, bodies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bodies: Vec<String> = bodies.into_iter().map(Into::into).collect();
        let mut expectations = self.expectations.lock();
        expectations.count = Some(bodies.len());
        expectations.bodies = Some(bodies);
    }

    /// Messages received so far.
    pub fn received(&self) -> Vec<DeliveredMessage> {
        self.received.lock().clone()
    }

    /// Received payloads as text.
    pub fn bodies(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|message| message.payload_str().into_owned())
            .collect()
    }

    /// Forget received messages and expectations.
    pub fn reset(&self) {
        self.received.lock().clear();
        *self.expectations.lock() = Expectations::default();
        self.count.send_replace(0);
    }

    /// Wait until the expected number of messages arrived, then check them.
    pub async fn assert_satisfied(&self, timeout: Duration) -> Result<(), ExpectationError> {
        let (expected_count, expected_bodies) = {
            let expectations = self.expectations.lock();
            (expectations.count, expectations.bodies.clone())
        };

        if let Some(expected) = expected_count {
            let mut count = self.count.subscribe();
            let reached = tokio::time::timeout(timeout, count.wait_for(|n| *n >= expected))
                .await
                .is_ok();
            if !reached {
                return Err(ExpectationError::Timeout {
                    name: self.name.clone(),
                    expected,
                    received: *self.count.borrow(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let received = self.received.lock().len();
            if received != expected {
                return Err(ExpectationError::Count {
                    name: self.name.clone(),
                    expected,
                    received,
                });
            }
        }

        if let Some(expected) = expected_bodies {
            let received = self.bodies();
            if received != expected {
                return Err(ExpectationError::Bodies {
                    name: self.name.clone(),
                    expected,
                    received,
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn accept(&self, message: DeliveredMessage) -> anyhow::Result<()> {
        let count = {
            let mut received = self.received.lock();
            received.push(message);
            received.len()
        };
        self.count.send_replace(count);
        Ok(())
    }
}

/// Transform followed by a sink, as a consumer handler.
pub struct SinkHandler {
    transform: Arc<dyn Transform>,
    sink: Arc<dyn Sink>,
}

impl SinkHandler {
    pub fn new(transform: Arc<dyn Transform>, sink: Arc<dyn Sink>) -> Self {
        Self { transform, sink }
    }
}

#[async_trait]
impl MessageHandler for SinkHandler {
    async fn handle(&self, message: DeliveredMessage) -> anyhow::Result<()> {
        let payload = self.transform.apply(message.payload.clone())?;
        self.sink.accept(message.with_payload(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Uppercase;
    use filebridge_common::Message;
    use filebridge_framework::{Broker, MemoryBroker, PublisherConfig};

    fn delivered(body: &str) -> DeliveredMessage {
        Message::new("output", body.as_bytes().to_vec()).deliver()
    }

    #[tokio::test]
    async fn test_mock_sink_satisfied() {
        let sink = MockSink::new("output");
        sink.expect_bodies(["a", "b"]);

        sink.accept(delivered("a")).await.unwrap();
        sink.accept(delivered("b")).await.unwrap();

        tokio_test::assert_ok!(sink.assert_satisfied(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_mock_sink_waits_for_late_message() {
        let sink = Arc::new(MockSink::new("output"));
        sink.expect_message_count(1);

        let late = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            late.accept(delivered("late")).await.unwrap();
        });

        sink.assert_satisfied(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_sink_reports_failures() {
        let sink = MockSink::new("output");
        sink.expect_message_count(1);
        let err = sink
            .assert_satisfied(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExpectationError::Timeout { received: 0, .. }));

        sink.accept(delivered("one")).await.unwrap();
        sink.accept(delivered("two")).await.unwrap();
        let err = sink
            .assert_satisfied(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExpectationError::Count { expected: 1, received: 2, .. }));

        sink.reset();
        sink.expect_bodies(["HELLO"]);
        sink.accept(delivered("hello")).await.unwrap();
        let err = sink
            .assert_satisfied(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ExpectationError::Bodies { .. }));
    }

    #[tokio::test]
    async fn test_sink_handler_applies_transform() {
        let sink = Arc::new(MockSink::new("output"));
        let handler = SinkHandler::new(Arc::new(Uppercase), sink.clone());

        handler.handle(delivered("hello world!")).await.unwrap();
        assert_eq!(sink.bodies(), vec!["HELLO WORLD!"]);

        assert!(handler.handle(delivered_bytes(&[0xff])).await.is_err());
        assert_eq!(sink.received().len(), 1);
    }

    fn delivered_bytes(bytes: &[u8]) -> DeliveredMessage {
        Message::new("output", bytes.to_vec()).deliver()
    }

    #[tokio::test]
    async fn test_publishing_sink_forwards() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Arc::new(MessagePublisher::new(
            broker.clone(),
            PublisherConfig::default(),
        ));
        publisher.connect().await.unwrap();

        let sink = PublishingSink::new(publisher, "archive");
        sink.accept(delivered("keep me")).await.unwrap();

        let mut sub = broker.subscribe("archive").await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload, b"keep me");
    }

    #[test]
    fn test_sink_kind_config() {
        let kind: SinkKind =
            json5::from_str(r#"{ type: "forward", destination: "archive" }"#).unwrap();
        assert_eq!(
            kind,
            SinkKind::Forward {
                destination: "archive".to_string()
            }
        );
        assert_eq!(SinkKind::default(), SinkKind::Log);
    }
}
