use crate::error::{Error, Result};

/// Default key expression prefix for all FileBridge destinations.
pub const KEY_PREFIX: &str = "filebridge";

/// Destination that carries bridge status messages.
pub const STATUS_DESTINATION: &str = "@/status";

/// Characters with wildcard or reserved meaning in Zenoh key expressions.
const RESERVED_CHARS: [char; 4] = ['*', '$', '?', '#'];

/// Builder for constructing FileBridge key expressions.
///
/// Key expressions follow the pattern `<prefix>/<destination>`, where a
/// destination is a queue name such as `output` or `orders/inbound`.
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Get the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the key expression of a destination.
    ///
    /// # Example
    /// ```
    /// use filebridge_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::new("filebridge");
    /// assert_eq!(builder.destination("output"), "filebridge/output");
    /// ```
    pub fn destination(&self, name: &str) -> String {
        if name.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Build the key expression for bridge status.
    ///
    /// # Example
    /// ```
    /// use filebridge_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::default();
    /// assert_eq!(builder.status_key(), "filebridge/@/status");
    /// ```
    pub fn status_key(&self) -> String {
        self.destination(STATUS_DESTINATION)
    }

    /// Build a wildcard matching every destination under the prefix.
    pub fn wildcard(&self) -> String {
        format!("{}/**", self.prefix)
    }

    /// Recover the destination name from a full key expression.
    ///
    /// Returns `None` when the key does not live under this prefix.
    pub fn strip_prefix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }
}

/// Check that a destination name is usable as a queue.
///
/// Names are one or more non-empty `/`-separated chunks without Zenoh
/// wildcard or reserved characters.
pub fn validate_destination(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::Destination {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("destination is empty"));
    }

    if name.split('/').any(str::is_empty) {
        return Err(invalid("destination contains an empty chunk"));
    }

    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(invalid(&format!("reserved character '{}'", c)));
    }

    Ok(())
}
