//! Zenoh-backed broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use zenoh::Session;
use zenoh::qos::CongestionControl;
use zenoh::sample::SampleKind;

use filebridge_common::{Format, KeyExprBuilder, Message, ZenohConfig, decode_auto, encode};

use super::{Broker, Subscription};
use crate::error::BrokerError;

/// Broker publishing message envelopes under `<prefix>/<destination>`.
///
/// Puts use blocking congestion control so a slow subscriber applies
/// backpressure instead of losing messages.
pub struct ZenohBroker {
    config: ZenohConfig,
    keys: KeyExprBuilder,
    format: Format,
    session: RwLock<Option<Arc<Session>>>,
}

impl std::fmt::Debug for ZenohBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZenohBroker")
            .field("mode", &self.config.mode)
            .field("prefix", &self.keys.prefix())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ZenohBroker {
    /// Create a broker that opens its own session on `connect`.
    pub fn new(config: ZenohConfig, key_prefix: impl Into<String>) -> Self {
        Self {
            config,
            keys: KeyExprBuilder::new(key_prefix),
            format: Format::default(),
            session: RwLock::new(None),
        }
    }

    /// Create a broker on top of an already open session.
    pub fn with_session(session: Arc<Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            config: ZenohConfig::default(),
            keys: KeyExprBuilder::new(key_prefix),
            format: Format::default(),
            session: RwLock::new(Some(session)),
        }
    }

    /// Set the envelope serialization format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Key expression builder used for destinations.
    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    /// The open session, if connected.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    async fn current(&self) -> Result<Arc<Session>, BrokerError> {
        self.session().await.ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl Broker for ZenohBroker {
    fn name(&self) -> &str {
        "zenoh"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let session = filebridge_common::connect(&self.config)
            .await
            .map_err(|e| BrokerError::Disconnected(e.to_string()))?;
        *guard = Some(Arc::new(session));

        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let session = self.current().await?;
        let key = self.keys.destination(&message.destination);
        let payload =
            encode(message, self.format).map_err(|e| BrokerError::Codec(e.to_string()))?;

        session
            .put(&key, payload)
            .congestion_control(CongestionControl::Block)
            .await
            .map_err(|e| BrokerError::Transient(format!("put on {}: {}", key, e)))?;

        tracing::trace!(key = %key, id = %message.id, "Envelope put");
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription, BrokerError> {
        let session = self.current().await?;
        let key = self.keys.destination(destination);

        let subscriber = session
            .declare_subscriber(&key)
            .await
            .map_err(|e| BrokerError::Transient(format!("subscribe on {}: {}", key, e)))?;

        tracing::debug!(key = %key, "Declared subscriber");

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            loop {
                match subscriber.recv_async().await {
                    Ok(sample) => {
                        if sample.kind() == SampleKind::Delete {
                            tracing::trace!(key = %sample.key_expr(), "Ignoring delete sample");
                            continue;
                        }

                        let payload = sample.payload().to_bytes();
                        match decode_auto::<Message>(&payload) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    key = %sample.key_expr(),
                                    payload_len = payload.len(),
                                    error = %e,
                                    "Dropping undecodable envelope"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "Subscriber closed");
                        break;
                    }
                }
            }

            if let Err(e) = subscriber.undeclare().await {
                tracing::debug!(error = %e, "Failed to undeclare subscriber");
            }
        });

        Ok(Subscription::new(destination, rx).with_forwarder(forwarder))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session
                .close()
                .await
                .map_err(|e| BrokerError::Transient(format!("close: {}", e)))?;
            tracing::debug!("Zenoh session closed");
        }
        Ok(())
    }
}
