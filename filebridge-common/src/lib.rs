//! FileBridge Common Library
//!
//! This crate provides shared types and utilities for FileBridge bridges:
//!
//! - [`message`] - Pipeline data model (`FileEvent`, `Message`, `DeliveredMessage`)
//! - [`serialization`] - JSON/CBOR encoding and decoding of the wire envelope
//! - [`config`] - Zenoh and logging configuration sections
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Key expression builders and destination validation
//! - [`health`] - Health snapshot exchanged in status messages
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod health;
pub mod keyexpr;
pub mod message;
pub mod serialization;
pub mod session;

pub use config::{LogFormat, LoggingConfig, ZENOH_MODES, ZenohConfig};
pub use error::{Error, Result};
pub use health::HealthSnapshot;
pub use keyexpr::{KEY_PREFIX, KeyExprBuilder, STATUS_DESTINATION, validate_destination};
pub use message::{DeliveredMessage, FileEvent, FileIdentity, Message, MessageId};
pub use serialization::{Format, decode, decode_auto, encode};
pub use session::connect;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level` when set. Fails when the level is
/// not a valid filter or a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.level, e)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "filebridge=loud".to_string(),
            format: LogFormat::Text,
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(init_tracing(&config), Err(Error::Config(_))));
        }
    }
}
