//! Bridge status reporting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use filebridge_common::{HealthSnapshot, STATUS_DESTINATION};

use crate::Result;
use crate::publisher::MessagePublisher;

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "file").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// When the status was emitted.
    pub timestamp: DateTime<Utc>,
    /// Pipeline counters, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSnapshot>,
    /// Additional metadata (service-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_status(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            timestamp: Utc::now(),
            health: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_status(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a health snapshot.
    pub fn with_health(mut self, health: HealthSnapshot) -> Self {
        self.health = Some(health);
        self
    }

    /// Publish this status to the `@/status` destination.
    pub async fn publish(&self, publisher: &MessagePublisher) -> Result<()> {
        publisher.publish_json(STATUS_DESTINATION, self).await?;
        Ok(())
    }
}

/// Helper to publish bridge status on startup and shutdown.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    publisher: Arc<MessagePublisher>,
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(
        publisher: Arc<MessagePublisher>,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        status.publish(&self.publisher).await
    }

    /// Publish "offline" status, with final counters when known.
    pub async fn publish_offline(&self, health: Option<HealthSnapshot>) -> Result<()> {
        let mut status = BridgeStatus::offline(&self.bridge_name, &self.version);
        if let Some(health) = health {
            status = status.with_health(health);
        }
        status.publish(&self.publisher).await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        BridgeStatus::error(&self.bridge_name, &self.version, error)
            .publish(&self.publisher)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::publisher::PublisherConfig;

    #[test]
    fn test_status_with_metadata() {
        let status = BridgeStatus::running("file", "0.1.0").with_metadata(serde_json::json!({
            "watch_dir": "target/input",
            "destination": "output"
        }));

        assert_eq!(status.status, "running");
        assert_eq!(status.metadata["watch_dir"], "target/input");
    }

    #[test]
    fn test_status_serialization_flattens_metadata() {
        let status = BridgeStatus::error("file", "1.0.0", "disk full");

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"file\""));
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"disk full\""));
        assert!(!json.contains("\"health\""));
    }

    #[tokio::test]
    async fn test_status_published_to_status_destination() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Arc::new(MessagePublisher::new(
            broker.clone(),
            PublisherConfig::default(),
        ));
        publisher.connect().await.unwrap();

        let status = StatusPublisher::new(publisher, "file", "0.1.0");
        status.publish_running(None).await.unwrap();
        status
            .publish_offline(Some(HealthSnapshot {
                files_detected: 2,
                ..Default::default()
            }))
            .await
            .unwrap();

        let mut sub = broker.subscribe(STATUS_DESTINATION).await.unwrap();
        let running: BridgeStatus =
            serde_json::from_slice(&sub.recv().await.unwrap().payload).unwrap();
        let offline: BridgeStatus =
            serde_json::from_slice(&sub.recv().await.unwrap().payload).unwrap();

        assert_eq!(running.status, "running");
        assert_eq!(offline.status, "offline");
        assert_eq!(offline.health.unwrap().files_detected, 2);
    }
}
