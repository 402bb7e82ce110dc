//! Data model flowing through a bridge pipeline.
//!
//! A [`FileEvent`] is produced by the directory watcher, turned into a
//! [`Message`] by the publisher, carried by the broker as the wire envelope,
//! and handed to consumer handlers as a [`DeliveredMessage`].

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to a message when it is created.
///
/// Retries of the same message reuse the id, which lets consumers drop
/// redelivered copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot identity of a file: path plus size and modification time.
///
/// Two observations with the same identity refer to the same file content
/// as far as the watcher can tell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// A stable file observed in the watched directory.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Full path of the file.
    pub path: PathBuf,
    /// File content at the time it was read.
    pub bytes: Vec<u8>,
    /// Size observed by the stability check.
    pub size: u64,
    /// Modification time observed by the stability check.
    pub modified: SystemTime,
    /// When the file was detected as stable.
    pub detected_at: DateTime<Utc>,
}

impl FileEvent {
    /// Create an event for a stable file.
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>, size: u64, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            bytes,
            size,
            modified,
            detected_at: Utc::now(),
        }
    }

    /// Identity of the snapshot this event was read from.
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            path: self.path.clone(),
            size: self.size,
            modified: self.modified,
        }
    }

    /// File name component, if any.
    pub fn file_name(&self) -> Option<Cow<'_, str>> {
        self.path.file_name().map(|name| name.to_string_lossy())
    }
}

/// A message addressed to a broker destination.
///
/// This is also the wire envelope: brokers serialize the whole struct so
/// the id and origin travel with the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Destination (queue) name.
    pub destination: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Originating file, when the message came from a watched directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(destination: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            destination: destination.into(),
            payload,
            origin: None,
            created_at: Utc::now(),
        }
    }

    /// Use a specific id instead of the generated one.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Record the file the payload was read from.
    pub fn with_origin(mut self, origin: impl AsRef<Path>) -> Self {
        self.origin = Some(origin.as_ref().display().to_string());
        self
    }

    /// Turn a received envelope into a delivered message.
    pub fn deliver(self) -> DeliveredMessage {
        DeliveredMessage {
            id: self.id,
            destination: self.destination,
            payload: self.payload,
            origin: self.origin,
            received_at: Utc::now(),
        }
    }
}

/// A message handed to a consumer handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub id: MessageId,
    pub destination: String,
    pub payload: Vec<u8>,
    pub origin: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl DeliveredMessage {
    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Copy of this message carrying a different payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }
}
