//! Bridge health counters.
//!
//! [`BridgeHealth`] is a [`PipelineObserver`]: register it on the pipeline
//! and read a [`HealthSnapshot`] whenever status needs to be reported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use filebridge_common::{DeliveredMessage, FileEvent, HealthSnapshot, Message, MessageId};

use crate::error::{BrokerError, PublishError};
use crate::observer::PipelineObserver;

/// Consecutive failed publishes after which the bridge reports "degraded".
const DEGRADED_AFTER_FAILURES: u64 = 3;

/// Bridge health metrics.
///
/// Tracks pipeline throughput and failures with lock-free counters.
#[derive(Debug)]
pub struct BridgeHealth {
    /// Bridge name.
    bridge_name: String,
    /// Start time for uptime calculation.
    start_time: Instant,
    files_detected: AtomicU64,
    publish_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    /// Failed publishes since the last successful one.
    consecutive_failures: AtomicU64,
    messages_delivered: AtomicU64,
    handler_errors: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl BridgeHealth {
    /// Create a new health tracker.
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            start_time: Instant::now(),
            files_detected: AtomicU64::new(0),
            publish_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Bridge name.
    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }

    /// Record a terminal error not seen through the observer hooks.
    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    /// Overall status derived from the counters.
    pub fn status(&self) -> &'static str {
        if self.consecutive_failures.load(Ordering::SeqCst) >= DEGRADED_AFTER_FAILURES {
            "degraded"
        } else {
            "healthy"
        }
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            bridge: self.bridge_name.clone(),
            status: self.status().to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            files_detected: self.files_detected.load(Ordering::SeqCst),
            messages_published: self.messages_published.load(Ordering::SeqCst),
            publish_attempts: self.publish_attempts.load(Ordering::SeqCst),
            publish_failures: self.publish_failures.load(Ordering::SeqCst),
            messages_delivered: self.messages_delivered.load(Ordering::SeqCst),
            handler_errors: self.handler_errors.load(Ordering::SeqCst),
            last_error: self.last_error.read().clone(),
        }
    }
}

impl PipelineObserver for BridgeHealth {
    fn file_detected(&self, _event: &FileEvent) {
        self.files_detected.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_attempted(&self, _message: &Message, _attempt: u32, _outcome: &Result<(), BrokerError>) {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_completed(&self, _message: &Message, result: &Result<MessageId, PublishError>) {
        match result {
            Ok(_) => {
                self.messages_published.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::SeqCst);
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                self.record_error(e.to_string());
            }
        }
    }

    fn message_delivered(&self, _message: &DeliveredMessage) {
        self.messages_delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_failed(&self, _message: &DeliveredMessage, error: &str) {
        self.handler_errors.fetch_add(1, Ordering::SeqCst);
        self.record_error(error);
    }
}
