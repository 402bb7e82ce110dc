//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::signal;

use filebridge_common::{HealthSnapshot, init_tracing};

use crate::broker::{Broker, ZenohBroker};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::{MessagePublisher, PublisherConfig};
use crate::status::StatusPublisher;

/// A long-running component driven by [`BridgeRunner`].
#[async_trait]
pub trait Service: Send {
    /// Start the service. On error the service must have released
    /// everything it acquired.
    async fn start(&mut self) -> Result<()>;

    /// Stop the service. Must be idempotent.
    async fn stop(&mut self) -> Result<()>;

    /// Extra fields for the "running" status message.
    fn metadata(&self) -> Option<serde_json::Value> {
        None
    }

    /// Counters for the "offline" status message.
    fn health(&self) -> Option<HealthSnapshot> {
        None
    }
}

/// Bridge runner that owns the lifecycle of a bridge service.
///
/// Handles:
/// - Logging initialization
/// - Broker creation (Zenoh unless one is supplied)
/// - Status publishing (optional)
/// - Graceful shutdown on Ctrl+C or a caller-provided signal
///
/// # Example
///
/// ```ignore
/// use filebridge_framework::{BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = MyBridgeConfig::load("mybridge.json5")?;
///     let runner = BridgeRunner::new("mybridge", config)?.with_status_publishing();
///
///     let service = MyService::new(runner.broker());
///     runner.run(service).await?;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Broker shared with the service.
    broker: Arc<dyn Broker>,
    /// Publisher used for status messages.
    publisher: Arc<MessagePublisher>,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a runner backed by Zenoh.
    ///
    /// Initializes logging from the configuration. The Zenoh session is
    /// opened when the runner starts.
    pub fn new(name: impl Into<String>, config: C) -> Result<Self> {
        init_tracing(config.logging()).map_err(|e| BridgeError::config(e.to_string()))?;

        let broker = ZenohBroker::new(config.zenoh().clone(), config.key_prefix())
            .with_format(config.serialization());

        Ok(Self::with_broker(name, config, Arc::new(broker)))
    }

    /// Create a runner on top of an existing broker.
    ///
    /// Logging is left to the caller.
    pub fn with_broker(name: impl Into<String>, config: C, broker: Arc<dyn Broker>) -> Self {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();
        let publisher = Arc::new(MessagePublisher::new(
            broker.clone(),
            PublisherConfig::default(),
        ));

        Self {
            name,
            version,
            config,
            broker,
            publisher,
            status_publisher: None,
        }
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes status messages on startup, on
    /// start failure, and on shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get the broker shared with the service.
    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    /// Run the service until Ctrl+C is received.
    pub async fn run<S: Service>(self, service: S) -> Result<()> {
        self.run_until(service, async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
    }

    /// Run the service until `shutdown` completes.
    ///
    /// This will:
    /// 1. Start the service
    /// 2. Publish "running" status (if enabled)
    /// 3. Wait for the shutdown future
    /// 4. Publish "offline" status (if enabled)
    /// 5. Stop the service and close the broker
    pub async fn run_until<S, F>(self, mut service: S, shutdown: F) -> Result<()>
    where
        S: Service,
        F: Future<Output = ()> + Send,
    {
        tracing::info!(bridge = %self.name, version = %self.version, "Starting bridge");

        if let Some(ref status_pub) = self.status_publisher {
            self.publisher.connect().await?;

            if let Err(e) = service.start().await {
                tracing::error!(bridge = %self.name, error = %e, "Service failed to start");
                if let Err(status_err) = status_pub.publish_error(e.to_string()).await {
                    tracing::warn!(error = %status_err, "Failed to publish error status");
                }
                self.close_broker().await;
                return Err(e);
            }

            if let Err(e) = status_pub.publish_running(service.metadata()).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        } else if let Err(e) = service.start().await {
            tracing::error!(bridge = %self.name, error = %e, "Service failed to start");
            self.close_broker().await;
            return Err(e);
        }

        tracing::info!(bridge = %self.name, "Bridge running");

        shutdown.await;

        tracing::info!(bridge = %self.name, "Received shutdown signal");

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline(service.health()).await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        let result = service.stop().await;
        if let Err(ref e) = result {
            tracing::error!(bridge = %self.name, error = %e, "Service stopped with error");
        }

        self.close_broker().await;

        tracing::info!(bridge = %self.name, "Goodbye!");

        result
    }

    async fn close_broker(&self) {
        if let Err(e) = self.publisher.close().await {
            tracing::warn!(broker = self.broker.name(), error = %e, "Error closing broker");
        }
    }
}
