//! File bridge configuration.

use serde::{Deserialize, Serialize};

use filebridge_common::{Format, KEY_PREFIX, LoggingConfig, ZenohConfig, validate_destination};
use filebridge_framework::{BridgeConfig, BridgeError, ConsumerConfig, PublisherConfig};

use crate::pipeline::PipelineOptions;
use crate::sink::SinkKind;
use crate::transform::TransformKind;
use crate::watcher::WatchConfig;

/// Complete file bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBridgeConfig {
    /// Zenoh connection settings.
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Key expression prefix for queue destinations.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Wire format of published envelopes.
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Watched directory.
    pub file: WatchConfig,

    /// Queue the files are published to and consumed from.
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub pipeline: PipelineOptions,

    /// Transform applied to consumed payloads.
    #[serde(default)]
    pub transform: TransformKind,

    /// Where consumed messages go.
    #[serde(default)]
    pub sink: SinkKind,
}

/// Queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Destination name.
    #[serde(default = "default_destination")]
    pub destination: String,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_destination() -> String {
    "output".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
        }
    }
}

impl FileBridgeConfig {
    /// Validate the bridge-specific sections.
    pub fn validate_config(&self) -> anyhow::Result<()> {
        self.file.validate().map_err(anyhow::Error::msg)?;

        validate_destination(&self.queue.destination)
            .map_err(|e| anyhow::anyhow!("queue.destination: {}", e))?;

        self.publisher
            .retry
            .validate()
            .map_err(|e| anyhow::anyhow!("publisher.retry: {}", e))?;
        if self.publisher.attempt_timeout_ms == 0 {
            anyhow::bail!("publisher.attempt_timeout_ms must be > 0");
        }

        // Stop cancels retries after the drain timeout, then waits out the attempt in flight.
        let drain = self
            .pipeline
            .drain_timeout_ms
            .saturating_add(self.publisher.attempt_timeout_ms);
        if drain >= self.file.stop_timeout_ms {
            anyhow::bail!(
                "file.stop_timeout_ms ({}) must exceed pipeline.drain_timeout_ms + publisher.attempt_timeout_ms ({})",
                self.file.stop_timeout_ms,
                drain
            );
        }

        self.consumer
            .resubscribe
            .validate()
            .map_err(|e| anyhow::anyhow!("consumer.resubscribe: {}", e))?;

        if let SinkKind::Forward { destination } = &self.sink {
            validate_destination(destination)
                .map_err(|e| anyhow::anyhow!("sink.destination: {}", e))?;
            if destination == &self.queue.destination {
                anyhow::bail!(
                    "sink.destination must differ from queue.destination ('{}')",
                    destination
                );
            }
        }

        Ok(())
    }
}

impl BridgeConfig for FileBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn serialization(&self) -> Format {
        self.serialization
    }

    fn validate(&self) -> filebridge_framework::Result<()> {
        self.validate_config()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}
