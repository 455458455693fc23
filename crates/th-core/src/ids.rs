//! Channel identifier.
//!
//! Channel ids arrive from request paths and become directory names, so they
//! are validated once on construction and trusted everywhere after that.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Longest accepted channel id, in bytes.
const MAX_CHANNEL_ID_LEN: usize = 128;

/// Identifier of a channel, as used in `/channel/{id}.m3u8`.
///
/// Only ASCII letters, digits, `-`, `_` and `.` are allowed, and the id may
/// not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    /// Validate and wrap a channel id.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        if raw.is_empty() || raw.len() > MAX_CHANNEL_ID_LEN {
            return Err(Error::Validation(format!(
                "channel id must be 1..={MAX_CHANNEL_ID_LEN} bytes"
            )));
        }
        if raw.starts_with('.') {
            return Err(Error::Validation(format!(
                "channel id may not start with '.': {raw}"
            )));
        }
        let valid = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(Error::Validation(format!(
                "channel id contains invalid characters: {raw}"
            )));
        }
        Ok(Self(raw.to_owned()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}
