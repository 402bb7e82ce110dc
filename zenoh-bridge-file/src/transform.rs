//! Payload transforms applied before a message reaches the sink.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Rewrites a payload.
pub trait Transform: Send + Sync {
    fn apply(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

impl<F> Transform for F
where
    F: Fn(Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn apply(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        self(payload)
    }
}

/// Leaves the payload untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(payload)
    }
}

/// Upper-cases UTF-8 text. Fails on other payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uppercase;

impl Transform for Uppercase {
    fn apply(&self, payload: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let text = String::from_utf8(payload).context("payload is not UTF-8")?;
        Ok(text.to_uppercase().into_bytes())
    }
}

/// Transform selected from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    Passthrough,
    Uppercase,
}

impl TransformKind {
    pub fn build(self) -> Arc<dyn Transform> {
        match self {
            Self::Passthrough => Arc::new(Passthrough),
            Self::Uppercase => Arc::new(Uppercase),
        }
    }
}
