use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

/// Wire format of the message envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Cbor,
}

impl Format {
    /// Guess the format of an encoded envelope.
    ///
    /// JSON envelopes are objects or arrays; anything else is taken as CBOR.
    pub fn detect(data: &[u8]) -> Self {
        match data.first() {
            Some(b'{' | b'[') => Format::Json,
            _ => Format::Cbor,
        }
    }
}

pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => Ok(serde_json::to_vec(value)?),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => Ok(serde_json::from_slice(data)?),
        Format::Cbor => Ok(ciborium::from_reader(data)?),
    }
}

/// Decode an envelope of either format.
pub fn decode_auto<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    decode(data, Format::detect(data))
}
