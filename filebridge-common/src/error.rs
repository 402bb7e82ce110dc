use thiserror::Error;

/// Errors of the shared FileBridge layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("JSON envelope error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR envelope error: {0}")]
    Cbor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid destination '{name}': {reason}")]
    Destination { name: String, reason: String },
}

impl<E: std::fmt::Debug> From<ciborium::ser::Error<E>> for Error {
    fn from(e: ciborium::ser::Error<E>) -> Self {
        Error::Cbor(format!("{:?}", e))
    }
}

impl<E: std::fmt::Debug> From<ciborium::de::Error<E>> for Error {
    fn from(e: ciborium::de::Error<E>) -> Self {
        Error::Cbor(format!("{:?}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
