//! Queue consumer dispatching messages to a handler.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use filebridge_common::{DeliveredMessage, Message, MessageId};

use crate::broker::{Broker, Subscription};
use crate::error::ConsumeError;
use crate::observer::{NoopObserver, PipelineObserver};
use crate::retry::RetryPolicy;

/// Callback receiving each delivered message.
///
/// An error or a panic is logged and reported to the observer; the message
/// still counts as handled.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: DeliveredMessage) -> anyhow::Result<()>;
}

/// Consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Backoff between resubscribe attempts after the subscription ended.
    #[serde(default = "default_resubscribe")]
    pub resubscribe: RetryPolicy,

    /// Number of recent message ids remembered for duplicate suppression.
    /// Zero disables it.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long `unsubscribe` waits for the handler in flight.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_resubscribe() -> RetryPolicy {
    RetryPolicy::unbounded(Duration::from_millis(100), Duration::from_secs(5))
}

fn default_dedup_capacity() -> usize {
    1024
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            resubscribe: default_resubscribe(),
            dedup_capacity: default_dedup_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Consumer of one broker destination.
///
/// Messages are handled one at a time on a dedicated task, in the order
/// the broker delivered them.
pub struct MessageConsumer {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    observer: Arc<dyn PipelineObserver>,
    active: Option<Active>,
}

struct Active {
    source: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("broker", &self.broker.name())
            .field("config", &self.config)
            .field("source", &self.source())
            .finish()
    }
}

impl MessageConsumer {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            config,
            observer: Arc::new(NoopObserver),
            active: None,
        }
    }

    /// Set the observer notified of deliveries and handler failures.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Destination currently consumed.
    pub fn source(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.source.as_str())
    }

    /// Whether a receive task is running.
    pub fn is_subscribed(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Subscribe to `source` and start dispatching to `handler`.
    ///
    /// The initial subscription error is returned to the caller. Later
    /// disconnects are handled by resubscribing in the background.
    pub async fn subscribe(
        &mut self,
        source: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumeError> {
        if let Some(active) = &self.active {
            if !active.task.is_finished() {
                return Err(ConsumeError::AlreadySubscribed(active.source.clone()));
            }
        }

        let subscription =
            self.broker
                .subscribe(source)
                .await
                .map_err(|error| ConsumeError::Subscribe {
                    source_name: source.to_string(),
                    error,
                })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = Receiver {
            broker: self.broker.clone(),
            source: source.to_string(),
            handler,
            observer: self.observer.clone(),
            backoff: self.config.resubscribe.clone(),
            recent: RecentIds::new(self.config.dedup_capacity),
        };
        let task = tokio::spawn(receiver.run(subscription, shutdown_rx));

        tracing::info!(source = %source, broker = self.broker.name(), "Consumer subscribed");

        self.active = Some(Active {
            source: source.to_string(),
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop the receive task.
    ///
    /// Waits up to the configured stop timeout for the handler in flight,
    /// then aborts. No handler call starts after this returns.
    pub async fn unsubscribe(&mut self) -> Result<(), ConsumeError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        active.shutdown.send_replace(true);
        let mut task = active.task;
        let timeout = self.config.stop_timeout();

        let outcome = tokio::time::timeout(timeout, &mut task).await;
        match outcome {
            Ok(Ok(())) => {
                tracing::info!(source = %active.source, "Consumer unsubscribed");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(source = %active.source, error = %e, "Consumer task ended abnormally");
                Ok(())
            }
            Err(_) => {
                task.abort();
                let _ = task.await;
                tracing::warn!(
                    source = %active.source,
                    timeout_ms = self.config.stop_timeout_ms,
                    "Consumer did not stop in time, aborted"
                );
                Err(ConsumeError::StopTimeout {
                    source_name: active.source,
                    timeout_ms: self.config.stop_timeout_ms,
                })
            }
        }
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown.send_replace(true);
            active.task.abort();
        }
    }
}

enum Next {
    Message(Message),
    Ended,
    Shutdown,
}

struct Receiver {
    broker: Arc<dyn Broker>,
    source: String,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn PipelineObserver>,
    backoff: RetryPolicy,
    recent: RecentIds,
}

impl Receiver {
    async fn run(mut self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => Next::Shutdown,
                message = subscription.recv() => match message {
                    Some(message) => Next::Message(message),
                    None => Next::Ended,
                },
            };

            match next {
                Next::Message(message) => self.dispatch(message).await,
                Next::Ended => {
                    tracing::warn!(
                        source = %self.source,
                        error = %ConsumeError::Disconnected(self.source.clone()),
                        "Resubscribing"
                    );
                    match self.resubscribe(&mut shutdown).await {
                        Some(fresh) => subscription = fresh,
                        None => break,
                    }
                }
                Next::Shutdown => break,
            }
        }

        tracing::debug!(source = %self.source, "Receive loop stopped");
    }

    async fn dispatch(&mut self, message: Message) {
        if !self.recent.insert(message.id) {
            tracing::debug!(id = %message.id, source = %self.source, "Skipping redelivered message");
            return;
        }

        let delivered = message.deliver();
        self.observer.message_delivered(&delivered);

        let outcome = AssertUnwindSafe(self.handler.handle(delivered.clone()))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        tracing::warn!(id = %delivered.id, source = %self.source, error = %error, "Handler failed");
        self.observer.handler_failed(&delivered, &error);
    }

    /// Resubscribe until it works, the policy gives up, or shutdown.
    async fn resubscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Subscription> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let delay = self.backoff.delay_for(attempt);
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = match self.broker.connect().await {
                Ok(()) => self.broker.subscribe(&self.source).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(subscription) => {
                    tracing::info!(source = %self.source, attempt, "Resubscribed");
                    return Some(subscription);
                }
                Err(e) if self.backoff.allows(attempt) => {
                    tracing::debug!(source = %self.source, attempt, error = %e, "Resubscribe failed");
                }
                Err(e) => {
                    tracing::error!(
                        source = %self.source,
                        attempts = attempt,
                        error = %e,
                        "Giving up resubscribing"
                    );
                    return None;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded set of recently seen message ids, oldest evicted first.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::with_capacity(capacity.min(4096)),
        }
    }

    /// Returns false if `id` was already seen.
    fn insert(&mut self, id: MessageId) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Collect {
        bodies: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: DeliveredMessage) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let body = message.payload_str().into_owned();
            match body.as_str() {
                "bad" => anyhow::bail!("refused {}", body),
                "boom" => panic!("handler exploded"),
                _ => {}
            }
            self.bodies.lock().push(body);
            Ok(())
        }
    }

    impl Collect {
        fn bodies(&self) -> Vec<String> {
            self.bodies.lock().clone()
        }
    }

    #[derive(Default)]
    struct Failures(AtomicUsize);

    impl PipelineObserver for Failures {
        fn handler_failed(&self, _: &DeliveredMessage, _: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            resubscribe: RetryPolicy::unbounded(Duration::from_millis(5), Duration::from_millis(20)),
            dedup_capacity: 16,
            stop_timeout_ms: 500,
        }
    }

    async fn connected_broker() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        broker
    }

    async fn publish(broker: &MemoryBroker, body: &str) {
        broker
            .publish(&Message::new("output", body.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within 5s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_messages_handled_in_order() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let mut consumer = MessageConsumer::new(broker.clone(), fast_config());
        consumer.subscribe("output", handler.clone()).await.unwrap();

        for i in 0..20 {
            publish(&broker, &format!("msg-{i}")).await;
        }

        wait_until(|| handler.bodies().len() == 20).await;
        let expected: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
        assert_eq!(handler.bodies(), expected);

        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_isolated() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let failures = Arc::new(Failures::default());
        let mut consumer =
            MessageConsumer::new(broker.clone(), fast_config()).with_observer(failures.clone());
        consumer.subscribe("output", handler.clone()).await.unwrap();

        for body in ["first", "bad", "boom", "last"] {
            publish(&broker, body).await;
        }

        wait_until(|| handler.bodies().len() == 2).await;
        assert_eq!(handler.bodies(), vec!["first", "last"]);
        assert_eq!(failures.0.load(Ordering::SeqCst), 2);
        assert!(consumer.is_subscribed());

        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let mut consumer = MessageConsumer::new(broker.clone(), fast_config());
        consumer.subscribe("output", handler.clone()).await.unwrap();

        publish(&broker, "before").await;
        wait_until(|| handler.bodies().len() == 1).await;

        broker.disconnect();
        wait_until(|| broker.subscriber_count("output") == 1).await;
        assert!(broker.is_connected());

        publish(&broker, "after").await;
        wait_until(|| handler.bodies().len() == 2).await;
        assert_eq!(handler.bodies(), vec!["before", "after"]);

        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivered_ids_are_skipped() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let mut consumer = MessageConsumer::new(broker.clone(), fast_config());
        consumer.subscribe("output", handler.clone()).await.unwrap();

        let message = Message::new("output", b"once".to_vec());
        broker.publish(&message).await.unwrap();
        broker.publish(&message).await.unwrap();
        publish(&broker, "marker").await;

        wait_until(|| handler.bodies().len() == 2).await;
        assert_eq!(handler.bodies(), vec!["once", "marker"]);

        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_disabled_delivers_duplicates() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let config = ConsumerConfig {
            dedup_capacity: 0,
            ..fast_config()
        };
        let mut consumer = MessageConsumer::new(broker.clone(), config);
        consumer.subscribe("output", handler.clone()).await.unwrap();

        let message = Message::new("output", b"twice".to_vec());
        broker.publish(&message).await.unwrap();
        broker.publish(&message).await.unwrap();

        wait_until(|| handler.bodies().len() == 2).await;
        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_handler_calls_after_unsubscribe() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect::default());
        let mut consumer = MessageConsumer::new(broker.clone(), fast_config());
        consumer.subscribe("output", handler.clone()).await.unwrap();

        publish(&broker, "one").await;
        wait_until(|| handler.bodies().len() == 1).await;

        consumer.unsubscribe().await.unwrap();
        assert!(!consumer.is_subscribed());

        publish(&broker, "two").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.bodies(), vec!["one"]);
        assert_eq!(broker.pending("output"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_unhandled_messages_queued() {
        let broker = connected_broker().await;
        let slow = Arc::new(Collect {
            delay: Some(Duration::from_millis(100)),
            ..Collect::default()
        });
        let mut consumer = MessageConsumer::new(broker.clone(), fast_config());
        consumer.subscribe("output", slow.clone()).await.unwrap();

        for body in ["one", "two", "three"] {
            publish(&broker, body).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.unsubscribe().await.unwrap();

        let handled = slow.bodies();
        let left = broker.pending("output");
        assert!(left >= 1);
        assert_eq!(handled.len() + left, 3);

        let rest = Arc::new(Collect::default());
        let mut next = MessageConsumer::new(broker.clone(), fast_config());
        next.subscribe("output", rest.clone()).await.unwrap();
        wait_until(|| rest.bodies().len() == left).await;

        let mut all = handled;
        all.extend(rest.bodies());
        assert_eq!(all, vec!["one", "two", "three"]);
        next.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_twice_is_rejected() {
        let broker = connected_broker().await;
        let mut consumer = MessageConsumer::new(broker, fast_config());
        consumer
            .subscribe("output", Arc::new(Collect::default()))
            .await
            .unwrap();

        let err = consumer
            .subscribe("output", Arc::new(Collect::default()))
            .await
            .unwrap_err();
        assert_eq!(err, ConsumeError::AlreadySubscribed("output".to_string()));
        assert_eq!(consumer.source(), Some("output"));
    }

    #[tokio::test]
    async fn test_subscribe_failure_surfaces() {
        let broker = connected_broker().await;
        broker.set_fail_subscribe(true);
        let mut consumer = MessageConsumer::new(broker, fast_config());

        let err = consumer
            .subscribe("output", Arc::new(Collect::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Subscribe { ref source_name, .. } if source_name == "output"));
        assert!(!consumer.is_subscribed());
    }

    #[tokio::test]
    async fn test_unsubscribe_times_out_on_slow_handler() {
        let broker = connected_broker().await;
        let handler = Arc::new(Collect {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let config = ConsumerConfig {
            stop_timeout_ms: 50,
            ..fast_config()
        };
        let mut consumer = MessageConsumer::new(broker.clone(), config);
        consumer.subscribe("output", handler.clone()).await.unwrap();

        publish(&broker, "slow").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = consumer.unsubscribe().await.unwrap_err();
        assert!(matches!(err, ConsumeError::StopTimeout { timeout_ms: 50, .. }));
        assert!(handler.bodies().is_empty());
    }

    #[test]
    fn test_recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        let (a, b, c) = (MessageId::new(), MessageId::new(), MessageId::new());

        assert!(recent.insert(a));
        assert!(recent.insert(b));
        assert!(!recent.insert(a));
        assert!(recent.insert(c));
        assert!(recent.insert(a));
    }
}
