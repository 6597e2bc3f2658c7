//! Feed items and the queue message envelope.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// A configured feed to poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedSource {
    /// Feed URL (RSS 2.0 or Atom)
    pub url: String,

    /// Display name; falls back to the feed's own title when absent
    #[serde(default)]
    pub name: Option<String>,
}

impl FeedSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }
}

impl From<&str> for FeedSource {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// A single entry fetched from a feed. `link` is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: String,
    /// Publication timestamp as published by the feed
    pub published: Option<String>,
    /// Feed title (or configured name)
    pub source: String,
}

/// Envelope published to the queue, one per newly seen item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub msg_id: String,
    pub rss_entry: FeedItem,
}

impl QueueMessage {
    pub fn new(msg_id: u64, rss_entry: FeedItem) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            rss_entry,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check a raw delivery against the envelope schema.
    ///
    /// Returns the payload as a generic JSON value so the consumer stores
    /// exactly what the producer sent, extra fields included.
    pub fn validate_payload(bytes: &[u8]) -> Result<serde_json::Value> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(AppError::malformed)?;
        let object = value
            .as_object()
            .ok_or_else(|| AppError::malformed("payload is not a JSON object"))?;

        if !object.get("msg_id").is_some_and(|v| v.is_string()) {
            return Err(AppError::malformed("missing string field `msg_id`"));
        }
        match object.get("rss_entry") {
            Some(entry) if entry.get("link").is_some_and(|l| l.is_string()) => {}
            Some(_) => return Err(AppError::malformed("`rss_entry` has no string `link`")),
            None => return Err(AppError::malformed("missing field `rss_entry`")),
        }

        Ok(value)
    }
}
