//! Error types for the bridge framework.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in a bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Broker error outside of a publish or subscribe call.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Terminal publish failure.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Consumer failure.
    #[error(transparent)]
    Consume(#[from] ConsumeError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Service start/stop error.
    #[error("Service error: {0}")]
    Service(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a service error.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Wrap an error with context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<filebridge_common::Error> for BridgeError {
    fn from(err: filebridge_common::Error) -> Self {
        match err {
            filebridge_common::Error::Config(msg) => Self::Config(msg),
            filebridge_common::Error::Io(e) => Self::Io(e),
            other => Self::Serialization(other.to_string()),
        }
    }
}

/// Errors reported by a [`Broker`](crate::broker::Broker) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// `connect` has not been called, or `close` was.
    #[error("Broker not connected")]
    NotConnected,

    /// The connection to the broker was lost.
    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    /// The broker refused the operation for a reason expected to clear.
    #[error("Transient broker failure: {0}")]
    Transient(String),

    /// The message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The broker was closed for good.
    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Disconnected(_) | Self::Transient(_)
        )
    }

    /// Whether the connection must be re-established before retrying.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected(_))
    }
}

impl From<zenoh::Error> for BrokerError {
    fn from(err: zenoh::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Errors returned by [`MessagePublisher`](crate::publisher::MessagePublisher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// A single attempt failed; retried by the publisher.
    #[error("Transient publish failure to {destination}: {message}")]
    Transient {
        destination: String,
        message: String,
    },

    /// The retry budget was exhausted without broker acknowledgement.
    #[error("Destination {destination} unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        destination: String,
        attempts: u32,
        last_error: String,
    },

    /// The broker rejected the message in a way retries cannot fix.
    #[error("Publish to {destination} rejected: {message}")]
    Rejected {
        destination: String,
        message: String,
    },

    /// The broker could not be reached within the retry budget.
    #[error("Broker {broker} unreachable after {attempts} attempts: {last_error}")]
    ConnectFailed {
        broker: String,
        attempts: u32,
        last_error: String,
    },

    /// The publisher was closed before the message was acknowledged.
    #[error("Publisher closed")]
    Closed,

    /// The destination name is not a valid queue name.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

impl PublishError {
    /// Whether this error ends the publish call.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transient { .. })
    }
}

/// Errors returned by [`MessageConsumer`](crate::consumer::MessageConsumer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// `subscribe` was called while a subscription is active.
    #[error("Consumer already subscribed to {0}")]
    AlreadySubscribed(String),

    /// The broker refused the subscription.
    #[error("Failed to subscribe to {source_name}: {error}")]
    Subscribe {
        source_name: String,
        error: BrokerError,
    },

    /// The subscription stream ended; the consumer resubscribes.
    #[error("Subscription to {0} disconnected")]
    Disconnected(String),

    /// The receive loop did not finish in time and was aborted.
    #[error("Consumer for {source_name} did not stop within {timeout_ms}ms")]
    StopTimeout { source_name: String, timeout_ms: u64 },
}
