//! FileBridge Framework
//!
//! Building blocks for moving messages between a bridge and a broker.
//!
//! # Overview
//!
//! This framework provides:
//! - [`Broker`] seam with [`ZenohBroker`] and the in-process [`MemoryBroker`]
//! - [`MessagePublisher`] with retry, backoff and reconnect
//! - [`MessageConsumer`] dispatching to a [`MessageHandler`] with panic isolation
//! - [`PipelineObserver`] hooks, [`TracingObserver`] and [`BridgeHealth`] counters
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for lifecycle management of a [`Service`]
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use filebridge_framework::{MemoryBroker, MessagePublisher, PublisherConfig};
//!
//! let broker = Arc::new(MemoryBroker::new());
//! let publisher = MessagePublisher::new(broker, PublisherConfig::default());
//! publisher.connect().await?;
//! let id = publisher.publish("output", b"HELLO WORLD!".to_vec()).await?;
//! ```

mod broker;
mod config;
mod consumer;
mod error;
mod health;
mod observer;
mod publisher;
mod retry;
mod runner;
mod status;

pub use broker::{Broker, MemoryBroker, Subscription, ZenohBroker};
pub use config::BridgeConfig;
pub use consumer::{ConsumerConfig, MessageConsumer, MessageHandler};
pub use error::{BridgeError, BrokerError, ConsumeError, PublishError, Result};
pub use health::BridgeHealth;
pub use observer::{NoopObserver, Observers, PipelineObserver, TracingObserver, preview};
pub use publisher::{MessagePublisher, PublisherConfig};
pub use retry::RetryPolicy;
pub use runner::{BridgeRunner, Service};
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from filebridge-common
pub use filebridge_common::{
    DeliveredMessage, FileEvent, FileIdentity, Format, HealthSnapshot, LoggingConfig, Message,
    MessageId, ZenohConfig,
};
