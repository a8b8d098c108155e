//! Validated stream key
//!
//! The key is the publisher-chosen path component identifying one logical
//! broadcast (`rtmp://host/live/<key>`). It doubles as a directory name on
//! shared storage and as a lock file name, so validation is strict and
//! happens exactly once, at the type boundary.

use serde::Serialize;

use crate::error::Error;

/// URL-safe stream identifier: `[A-Za-z0-9_-]{1,64}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    /// Validate and wrap a raw key.
    ///
    /// Anything outside `[A-Za-z0-9_-]{1,64}` is rejected; there is no
    /// normalization and no fallback name.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() || raw.len() > 64 {
            return Err(Error::InvalidStreamKey(raw.to_string()));
        }
        let valid = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(Error::InvalidStreamKey(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
