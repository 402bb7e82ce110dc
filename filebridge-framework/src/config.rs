//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use filebridge_common::{Format, LoggingConfig, ZenohConfig, validate_destination};

use crate::error::{BridgeError, Result};

/// Trait for bridge configuration types.
///
/// Implement this trait for a bridge's configuration struct to get
/// loading, validation, and access to the fields the runner needs.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use filebridge_framework::{BridgeConfig, BridgeError, LoggingConfig, ZenohConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub key_prefix: String,
///     pub inputs: Vec<String>,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn zenoh(&self) -> &ZenohConfig {
///         &self.zenoh
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn key_prefix(&self) -> &str {
///         &self.key_prefix
///     }
///
///     fn validate(&self) -> filebridge_framework::Result<()> {
///         if self.inputs.is_empty() {
///             return Err(BridgeError::validation("At least one input required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the key expression prefix for this bridge.
    fn key_prefix(&self) -> &str;

    /// Wire format of published envelopes.
    fn serialization(&self) -> Format {
        Format::default()
    }

    /// Bridge-specific validation, called after the common checks.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Checks shared by every bridge, then [`validate`](Self::validate).
    fn validate_all(&self) -> Result<()> {
        self.zenoh()
            .validate_mode()
            .map_err(|e| BridgeError::validation(e.to_string()))?;

        validate_destination(self.key_prefix())
            .map_err(|e| BridgeError::validation(format!("key_prefix: {}", e)))?;

        self.validate()
    }

    /// Parse configuration from a JSON5 string and validate it.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Validates after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }
}
