//! Message broker seam.
//!
//! The publisher and the consumer only talk to a [`Broker`]. Two
//! implementations are provided:
//!
//! - [`ZenohBroker`] maps destinations to Zenoh key expressions
//! - [`MemoryBroker`] keeps FIFO queues in process and can inject faults

mod memory;
mod zenoh_broker;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use filebridge_common::Message;

use crate::error::BrokerError;

pub use memory::MemoryBroker;
pub use zenoh_broker::ZenohBroker;

/// Publish/subscribe operations the bridge relies on.
///
/// Implementations must deliver messages of one destination to a
/// subscription in the order they were accepted.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Short name for logs ("zenoh", "memory").
    fn name(&self) -> &str;

    /// Establish the connection. Calling it while connected is a no-op.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Hand a message to the broker. Returns once the broker accepted it.
    async fn publish(&self, message: &Message) -> Result<(), BrokerError>;

    /// Start receiving the messages of a destination.
    async fn subscribe(&self, destination: &str) -> Result<Subscription, BrokerError>;

    /// Release the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Stream of messages for one destination.
///
/// [`recv`](Self::recv) returns `None` once the broker side went away; the
/// holder is expected to subscribe again.
pub struct Subscription {
    destination: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    forwarder: Option<JoinHandle<()>>,
    on_unreceived: Option<ReturnUnreceived>,
}

type ReturnUnreceived = Box<dyn FnOnce(Vec<Message>) + Send + Sync>;

impl Subscription {
    /// Wrap a channel receiver.
    pub fn new(destination: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            destination: destination.into(),
            receiver,
            forwarder: None,
            on_unreceived: None,
        }
    }

    /// Attach the task feeding the channel; it is aborted on drop.
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Hand messages delivered to the channel but never received back to
    /// the broker when the subscription is dropped.
    pub fn on_unreceived<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Vec<Message>) + Send + Sync + 'static,
    {
        self.on_unreceived = Some(Box::new(callback));
        self
    }

    /// Destination this subscription listens to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        if let Some(callback) = self.on_unreceived.take() {
            self.receiver.close();
            let mut unreceived = Vec::new();
            while let Ok(message) = self.receiver.try_recv() {
                unreceived.push(message);
            }
            if !unreceived.is_empty() {
                callback(unreceived);
            }
        }
    }
}
