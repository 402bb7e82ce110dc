//! Configuration sections shared by every bridge.
//!
//! Bridges embed these in their own JSON5 configuration struct; loading and
//! validation live in the framework's `BridgeConfig` trait.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Zenoh session modes.
pub const ZENOH_MODES: [&str; 3] = ["peer", "client", "router"];

/// Zenoh connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// One of [`ZENOH_MODES`].
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Endpoints to connect to, e.g. `tcp/localhost:7447`.
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on.
    #[serde(default)]
    pub listen: Vec<String>,
}

fn default_mode() -> String {
    "peer".to_string()
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
        }
    }
}

impl ZenohConfig {
    /// Client of the given router endpoints.
    pub fn client<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: "client".to_string(),
            connect: endpoints.into_iter().map(Into::into).collect(),
            listen: Vec::new(),
        }
    }

    /// Reject modes Zenoh does not know.
    pub fn validate_mode(&self) -> Result<()> {
        if ZENOH_MODES.contains(&self.mode.as_str()) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "zenoh.mode must be one of {:?}, got '{}'",
                ZENOH_MODES, self.mode
            )))
        }
    }

    /// Translate into a native Zenoh configuration.
    pub fn to_zenoh(&self) -> Result<zenoh::Config> {
        self.validate_mode()?;

        let mut config = zenoh::Config::default();
        insert(&mut config, "mode", &self.mode)?;
        if !self.connect.is_empty() {
            insert(&mut config, "connect/endpoints", &self.connect)?;
        }
        if !self.listen.is_empty() {
            insert(&mut config, "listen/endpoints", &self.listen)?;
        }
        Ok(config)
    }
}

fn insert<T: Serialize + ?Sized>(config: &mut zenoh::Config, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    config
        .insert_json5(key, &json)
        .map_err(|e| Error::Config(format!("zenoh {}: {}", key, e)))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level or `EnvFilter` directive, e.g. `info,filebridge_framework=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
