//! In-process broker with queue semantics and fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use filebridge_common::Message;

use super::{Broker, Subscription};
use crate::error::BrokerError;

/// Broker keeping one FIFO queue per destination in memory.
///
/// Each message goes to exactly one subscriber (round-robin when several
/// are attached). Messages published while nobody listens are retained and
/// handed to the next subscriber in order. Messages a subscription had
/// buffered but not received when it was dropped go back to the front of
/// the queue.
///
/// Fault injection hooks make failure paths reproducible in tests:
///
/// ```
/// # tokio_test::block_on(async {
/// use filebridge_framework::{Broker, MemoryBroker};
/// use filebridge_common::Message;
///
/// let broker = MemoryBroker::new();
/// broker.connect().await.unwrap();
/// broker.fail_next_publishes(1);
///
/// let message = Message::new("output", b"hi".to_vec());
/// assert!(broker.publish(&message).await.is_err());
/// assert!(broker.publish(&message).await.is_ok());
/// assert_eq!(broker.pending("output"), 1);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    queues: HashMap<String, Queue>,
    faults: Faults,
    connects: u64,
    publish_attempts: u64,
    published: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_publishes: u32,
    fail_publishes: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    publish_latency: Duration,
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<Message>,
    subscribers: Vec<mpsc::UnboundedSender<Message>>,
    next: usize,
}

impl Queue {
    /// Deliver to the next live subscriber, or keep the message pending.
    fn offer(&mut self, message: Message) {
        let mut message = message;
        while !self.subscribers.is_empty() {
            let index = self.next % self.subscribers.len();
            match self.subscribers[index].send(message) {
                Ok(()) => {
                    self.next = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.subscribers.remove(index);
                    message = returned;
                }
            }
        }
        self.pending.push_back(message);
    }

    fn attach(&mut self, sender: mpsc::UnboundedSender<Message>) {
        while let Some(message) = self.pending.pop_front() {
            if let Err(mpsc::error::SendError(returned)) = sender.send(message) {
                self.pending.push_front(returned);
                return;
            }
        }
        self.subscribers.push(sender);
    }

    /// Put back messages a dropped subscription never received, keeping
    /// their order ahead of anything still pending.
    fn restore(&mut self, messages: Vec<Message>) {
        self.subscribers.retain(|sender| !sender.is_closed());
        if self.subscribers.is_empty() {
            for message in messages.into_iter().rev() {
                self.pending.push_front(message);
            }
        } else {
            for message in messages {
                self.offer(message);
            }
        }
    }

    fn live_subscribers(&mut self) -> usize {
        self.subscribers.retain(|sender| !sender.is_closed());
        self.subscribers.len()
    }
}

impl MemoryBroker {
    /// Create a disconnected broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publish calls with a transient error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().faults.fail_next_publishes = count;
    }

    /// Fail every publish call until turned off.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().faults.fail_publishes = fail;
    }

    /// Make `connect` fail until turned off.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().faults.fail_connect = fail;
    }

    /// Make `subscribe` fail until turned off.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.lock().faults.fail_subscribe = fail;
    }

    /// Delay every publish call by `latency` before it is processed.
    pub fn set_publish_latency(&self, latency: Duration) {
        self.state.lock().faults.publish_latency = latency;
    }

    /// Simulate a lost connection.
    ///
    /// Every subscription ends after draining what it already received,
    /// and operations fail with [`BrokerError::NotConnected`] until the
    /// next `connect`.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        for queue in state.queues.values_mut() {
            queue.subscribers.clear();
        }
        tracing::debug!("Memory broker disconnected");
    }

    /// Whether the broker is connected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> u64 {
        self.state.lock().connects
    }

    /// Number of publish calls, failed ones included.
    pub fn publish_attempts(&self) -> u64 {
        self.state.lock().publish_attempts
    }

    /// Number of messages accepted.
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    /// Messages of a destination waiting for a subscriber.
    pub fn pending(&self, destination: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(destination)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Live subscriptions of a destination.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.state
            .lock()
            .queues
            .get_mut(destination)
            .map_or(0, Queue::live_subscribers)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.faults.fail_connect {
            return Err(BrokerError::Disconnected(
                "injected connect failure".to_string(),
            ));
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let latency = self.state.lock().faults.publish_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.publish_attempts += 1;

        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.faults.fail_publishes {
            return Err(BrokerError::Transient(
                "injected publish failure".to_string(),
            ));
        }
        if state.faults.fail_next_publishes > 0 {
            state.faults.fail_next_publishes -= 1;
            return Err(BrokerError::Transient(
                "injected publish failure".to_string(),
            ));
        }

        state
            .queues
            .entry(message.destination.clone())
            .or_default()
            .offer(message.clone());
        state.published += 1;

        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription, BrokerError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        if state.faults.fail_subscribe {
            return Err(BrokerError::Transient(
                "injected subscribe failure".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .queues
            .entry(destination.to_string())
            .or_default()
            .attach(tx);

        let shared = Arc::clone(&self.state);
        let name = destination.to_string();
        Ok(Subscription::new(destination, rx).on_unreceived(move |messages| {
            tracing::debug!(destination = %name, count = messages.len(), "Returning unreceived messages");
            shared.lock().queues.entry(name).or_default().restore(messages);
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connected = false;
        for queue in state.queues.values_mut() {
            queue.subscribers.clear();
        }
        Ok(())
    }
}
