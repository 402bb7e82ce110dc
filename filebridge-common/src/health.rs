//! Health snapshot exchanged in bridge status messages.
//!
//! The framework's `BridgeHealth` produces these; anything listening on the
//! status key can deserialize them without depending on the framework.

use serde::{Deserialize, Serialize};

/// Point-in-time counters of a bridge pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Bridge name.
    pub bridge: String,
    /// Overall health status ("healthy", "degraded", "starting").
    pub status: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Stable files detected by the watcher.
    pub files_detected: u64,
    /// Messages acknowledged by the broker.
    pub messages_published: u64,
    /// Individual publish attempts, including retries.
    pub publish_attempts: u64,
    /// Publishes that ended without broker acknowledgement.
    pub publish_failures: u64,
    /// Messages handed to the consumer handler.
    pub messages_delivered: u64,
    /// Handler invocations that failed or panicked.
    pub handler_errors: u64,
    /// Most recent terminal error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    /// Ratio of successful publishes to finished publishes, in percent.
    pub fn publish_success_rate(&self) -> f64 {
        let total = self.messages_published + self.publish_failures;
        if total == 0 {
            100.0
        } else {
            (self.messages_published as f64 / total as f64) * 100.0
        }
    }
}
