//! Storage abstractions for batch objects and the dedup boundary.
//!
//! Batches are written once and never modified, grouped by UTC date:
//!
//! ```text
//! {root}/
//! ├── 2025-01-06/
//! │   ├── rss_batch_20250106T101500_part1.json
//! │   └── rss_batch_20250106T103000_part2.json
//! └── 2025-01-07/
//!     └── rss_batch_20250107T000512_part1.json
//! ```

pub mod dedup;
pub mod local;
#[cfg(test)]
pub(crate) mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;

// Re-export for convenience
pub use dedup::{DedupStore, ProcessedLinks};
pub use local::LocalObjectWriter;
#[cfg(feature = "s3")]
pub use s3::S3ObjectWriter;

/// Location of a batch object relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// UTC partition date
    pub date: NaiveDate,
    /// Object file name, e.g. `rss_batch_20250106T101500_part1.json`
    pub name: String,
}

impl ObjectKey {
    pub fn new(date: NaiveDate, name: impl Into<String>) -> Self {
        Self {
            date,
            name: name.into(),
        }
    }

    /// `<root>/<YYYY-MM-DD>/<name>`, or `<YYYY-MM-DD>/<name>` for an empty root.
    pub fn path(&self, root: &str) -> String {
        let root = root.trim_matches('/');
        let partition = self.date.format("%Y-%m-%d");
        if root.is_empty() {
            format!("{}/{}", partition, self.name)
        } else {
            format!("{}/{}/{}", root, partition, self.name)
        }
    }
}

/// Trait for batch object backends.
///
/// One call is one attempt; retrying belongs to the caller.
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Upload a finished batch, returning where it landed.
    async fn upload(&self, key: &ObjectKey, payload: Vec<u8>) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_path() {
        let key = ObjectKey::new(
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            "rss_batch_20250106T101500_part1.json",
        );

        assert_eq!(
            key.path("raw_rss_feed"),
            "raw_rss_feed/2025-01-06/rss_batch_20250106T101500_part1.json"
        );
        assert_eq!(
            key.path("/raw_rss_feed/"),
            "raw_rss_feed/2025-01-06/rss_batch_20250106T101500_part1.json"
        );
        assert_eq!(
            key.path(""),
            "2025-01-06/rss_batch_20250106T101500_part1.json"
        );
    }
}
